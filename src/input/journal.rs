//! systemd journal source
//!
//! Follows the journal of the sshd units through `journalctl -f -o json`.
//! Every output line is one JSON record carrying its `__CURSOR`. When the
//! follower process dies the source starts a new one after the last cursor
//! it handed out. Only followers that fail to start or die straight away
//! count against the restart budget; a follower that ran for a while or
//! produced output resets it.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::process::{ExitStatus, Output, Stdio};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use super::{RespawnPolicy, SourceError, SourceReader};
use crate::models::{Cursor, JournalCursor, LogEntry, Platform};

const JOURNALCTL: &str = "journalctl";

/// Line reader over a running follower
pub struct FollowStream {
    lines: Split<Box<dyn AsyncBufRead + Send + Unpin>>,
    child: Option<Child>,
}

impl FollowStream {
    /// Stream over an arbitrary reader, without a process behind it
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(reader);
        FollowStream {
            lines: reader.split(b'\n'),
            child: None,
        }
    }

    fn from_child(mut child: Child) -> Result<Self, SourceError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Unavailable("follower has no stdout".to_string()))?;

        let mut stream = Self::from_reader(BufReader::new(stdout));
        stream.child = Some(child);
        Ok(stream)
    }

    /// Next line, `None` once the writer is gone
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let segment = self.lines.next_segment().await?;
        Ok(segment.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Stop the follower and collect its exit status
    pub async fn shutdown(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        // the process may already be gone; the wait below settles it either way
        let _ = child.start_kill();
        child.wait().await.ok()
    }
}

/// Starts journal followers
#[allow(async_fn_in_trait)]
pub trait JournalTransport {
    /// Cursor of the newest entry currently in the journal
    async fn tail_cursor(&mut self) -> Result<Option<JournalCursor>, SourceError>;

    /// Follow the journal from just after `after`, or from now on
    async fn follow(&mut self, after: Option<&JournalCursor>) -> Result<FollowStream, SourceError>;
}

/// [`JournalTransport`] backed by the `journalctl` binary
pub struct JournalctlTransport {
    units: Vec<String>,
}

impl JournalctlTransport {
    pub fn new(units: Vec<String>) -> Self {
        JournalctlTransport { units }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for unit in &self.units {
            args.push("-u".to_string());
            args.push(unit.clone());
        }
        args.extend(["--no-pager", "-q", "-o", "json"].map(String::from));
        args
    }

    /// Arguments for a follower started after `after`
    ///
    /// Without a cursor `-n 0` keeps history out; with one `-n all` makes
    /// sure nothing between the cursor and now is cut off.
    pub fn follow_args(&self, after: Option<&JournalCursor>) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-f".to_string());
        match after {
            Some(cursor) => {
                args.push("--after-cursor".to_string());
                args.push(cursor.as_str().to_string());
                args.extend(["-n", "all"].map(String::from));
            }
            None => args.extend(["-n", "0"].map(String::from)),
        }
        args
    }
}

impl JournalTransport for JournalctlTransport {
    async fn tail_cursor(&mut self) -> Result<Option<JournalCursor>, SourceError> {
        let output = Command::new(JOURNALCTL)
            .args(self.base_args())
            .args(["-n", "1"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SourceError::Spawn {
                program: JOURNALCTL.to_string(),
                source: e,
            })?;

        tail_cursor_from(&output)
    }

    async fn follow(&mut self, after: Option<&JournalCursor>) -> Result<FollowStream, SourceError> {
        let mut child = Command::new(JOURNALCTL)
            .args(self.follow_args(after))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Spawn {
                program: JOURNALCTL.to_string(),
                source: e,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("journalctl: {}", line);
                }
            });
        }

        FollowStream::from_child(child)
    }
}

/// Cursor of the newest record in the output of `journalctl -n 1`
///
/// An empty journal yields `None`. Lines that do not decode are passed
/// over in favour of the last one that does.
pub fn tail_cursor_from(output: &Output) -> Result<Option<JournalCursor>, SourceError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::Unavailable(format!(
            "journalctl exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let cursor = stdout
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| match decode_record(line) {
            Ok((cursor, _)) => Some(cursor),
            Err(e) => {
                log::debug!("Ignoring journal tail line: {}", e);
                None
            }
        });

    Ok(cursor)
}

#[derive(Deserialize)]
struct JournalRecord {
    #[serde(rename = "__CURSOR")]
    cursor: String,
    #[serde(rename = "MESSAGE", default)]
    message: serde_json::Value,
    #[serde(rename = "__REALTIME_TIMESTAMP", default)]
    realtime_usec: Option<String>,
}

/// Decode one `journalctl -o json` line
pub fn decode_record(line: &str) -> Result<(JournalCursor, LogEntry), SourceError> {
    let record: JournalRecord =
        serde_json::from_str(line).map_err(|e| SourceError::Decode(e.to_string()))?;

    let cursor = JournalCursor::new(record.cursor);
    let received_at = record
        .realtime_usec
        .as_deref()
        .and_then(|usec| usec.parse::<i64>().ok())
        .and_then(|usec| {
            DateTime::from_timestamp(
                usec.div_euclid(1_000_000),
                (usec.rem_euclid(1_000_000) * 1_000) as u32,
            )
        })
        .unwrap_or_else(Utc::now);

    let entry = LogEntry {
        raw_message: message_text(&record.message),
        fields: None,
        sequence_token: Cursor::Journal(cursor.clone()),
        received_at,
    };
    Ok((cursor, entry))
}

/// journald prints non UTF-8 payloads as byte arrays and repeated fields
/// as arrays of values
fn message_text(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) if items.iter().all(Value::is_u64) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(Value::as_u64)
                .map(|b| b as u8)
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Value::Array(items) => items
            .iter()
            .map(message_text)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Journal follower with automatic restart
pub struct JournalSource<T> {
    transport: T,
    policy: RespawnPolicy,
    last_cursor: Option<JournalCursor>,
    stream: Option<FollowStream>,
    failures: u32,
    respawns: u64,
    follower_since: Instant,
    follower_output: bool,
}

impl<T: JournalTransport> JournalSource<T> {
    pub fn new(transport: T, policy: RespawnPolicy) -> Self {
        JournalSource {
            transport,
            policy,
            last_cursor: None,
            stream: None,
            failures: 0,
            respawns: 0,
            follower_since: Instant::now(),
            follower_output: false,
        }
    }

    /// Cursor of the last entry handed out
    pub fn last_cursor(&self) -> Option<&JournalCursor> {
        self.last_cursor.as_ref()
    }

    /// Number of follower restarts so far
    pub fn respawns(&self) -> u64 {
        self.respawns
    }

    fn follower_started(&mut self, stream: FollowStream) {
        self.stream = Some(stream);
        self.follower_since = Instant::now();
        self.follower_output = false;
    }

    async fn follower_ended(&mut self, reason: &str) {
        let status = match self.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => None,
        };

        let uptime = self.follower_since.elapsed();
        if self.follower_output || self.policy.healthy(uptime) {
            self.failures = 0;
        } else {
            self.failures += 1;
        }
        log::warn!(
            "Journal follower ended after {:?} ({}, status {:?}); restarting after cursor {:?}",
            uptime,
            reason,
            status,
            self.last_cursor.as_ref().map(JournalCursor::as_str)
        );
    }

    async fn respawn(&mut self) -> Result<(), SourceError> {
        if self.policy.exhausted(self.failures) {
            return Err(SourceError::RespawnExhausted {
                attempts: self.policy.max_attempts(),
            });
        }

        tokio::time::sleep(self.policy.delay_for(self.failures)).await;

        match self.transport.follow(self.last_cursor.as_ref()).await {
            Ok(stream) => {
                self.follower_started(stream);
                self.respawns += 1;
                log::info!("Journal follower restarted (restart #{})", self.respawns);
            }
            Err(e) => {
                self.failures += 1;
                log::error!("Failed to restart journal follower: {}", e);
            }
        }
        Ok(())
    }
}

impl<T: JournalTransport> SourceReader for JournalSource<T> {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    async fn open(&mut self, start: Option<Cursor>) -> Result<(), SourceError> {
        self.last_cursor = match start {
            Some(Cursor::Journal(cursor)) => Some(cursor),
            Some(other) => return Err(SourceError::CursorMismatch(other.to_string())),
            None => self.transport.tail_cursor().await?,
        };

        let stream = self.transport.follow(self.last_cursor.as_ref()).await?;
        self.follower_started(stream);
        self.failures = 0;

        log::info!(
            "Following journal after cursor {:?}",
            self.last_cursor.as_ref().map(JournalCursor::as_str)
        );
        Ok(())
    }

    async fn next_entry(&mut self) -> Result<LogEntry, SourceError> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                self.respawn().await?;
                continue;
            };

            let line = match stream.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.follower_ended("output closed").await;
                    continue;
                }
                Err(e) => {
                    self.follower_ended(&e.to_string()).await;
                    continue;
                }
            };

            if line.trim().is_empty() {
                continue;
            }
            self.follower_output = true;

            let (cursor, entry) = match decode_record(&line) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::debug!("Skipping journal line: {}", e);
                    continue;
                }
            };

            if let Some(last) = &self.last_cursor {
                if !cursor.is_after(last) {
                    log::debug!("Skipping already delivered cursor {}", cursor.as_str());
                    continue;
                }
            }

            self.last_cursor = Some(cursor);
            return Ok(entry);
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
        }
    }
}
