//! Detection loop
//!
//! Drives one session: open the platform's log source, then read, extract,
//! dispatch and commit entry by entry until interrupted or until the
//! source fails for good.
//!
//! Entries are handled strictly one at a time and the cursor is committed
//! only after the entry has been fully dispatched. A reader restarted from
//! the committed cursor can therefore repeat the last entry but never skip
//! one: delivery is at-least-once.
//!
//! [`CursorTracker::current`] seeds `open`. Restarts inside a source resume
//! from the last cursor that source handed out; since the next entry is
//! only requested once the previous one is committed, that cursor is the
//! committed one every time `next_entry` runs.

use thiserror::Error;
use tokio::sync::watch;

use crate::alerting::{notifier_for, AlertDispatcher};
use crate::config::{Config, DetectionConfig};
use crate::detection::{CursorTracker, PatternExtractor};
use crate::input::{
    AuthLogSource, EventLogSource, JournalSource, JournalctlTransport, RespawnPolicy, SourceError,
    SourceReader, WevtSecurityLog,
};
use crate::models::{LogEntry, Platform};
use crate::output::audit_log_for;
use crate::preflight::{checker_for, PreflightError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Log source failed: {0}")]
    Source(#[from] SourceError),

    #[error("{0} detection is disabled in the configuration")]
    Disabled(Platform),

    #[error("Detection loop already ran")]
    AlreadyRan,
}

/// Errors that end a daemon session before or during the loop
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Pre-flight check failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Clean,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Idle,
    Initializing,
    Streaming,
    Stopped(StopReason),
}

/// Counters for one session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub entries: u64,
    pub alerts: u64,
    pub notify_failures: u64,
    pub log_failures: u64,
}

pub struct DetectionLoop<S> {
    source: S,
    extractor: PatternExtractor,
    tracker: CursorTracker,
    dispatcher: AlertDispatcher,
    state: LoopState,
    stats: LoopStats,
}

impl<S: SourceReader> DetectionLoop<S> {
    pub fn new(source: S, dispatcher: AlertDispatcher) -> Self {
        let extractor = PatternExtractor::new(source.platform());
        DetectionLoop {
            source,
            extractor,
            tracker: CursorTracker::new(),
            dispatcher,
            state: LoopState::Idle,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn tracker(&self) -> &CursorTracker {
        &self.tracker
    }

    /// Run until `shutdown` turns true or the source fails
    ///
    /// Returns the session counters on a clean stop. The loop cannot be
    /// restarted once stopped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<LoopStats, EngineError> {
        if self.state != LoopState::Idle {
            return Err(EngineError::AlreadyRan);
        }

        let platform = self.source.platform();
        self.state = LoopState::Initializing;
        log::info!("Starting {} detection", platform);

        if let Err(e) = self.source.open(self.tracker.current().cloned()).await {
            return Err(self.fail(e));
        }

        self.state = LoopState::Streaming;
        self.dispatcher.record(&format!("{} detection started", platform));
        log::info!("Waiting for authentication failures...");

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => None,
                entry = self.source.next_entry() => Some(entry),
            };

            match next {
                Some(Ok(entry)) => self.process(entry),
                Some(Err(e)) => {
                    self.source.close().await;
                    return Err(self.fail(e));
                }
                None => {
                    self.source.close().await;
                    self.state = LoopState::Stopped(StopReason::Clean);
                    self.dispatcher.record(&format!("{} detection stopped", platform));
                    log::info!(
                        "Detection stopped after {} entries, {} alerts",
                        self.stats.entries,
                        self.stats.alerts
                    );
                    return Ok(self.stats);
                }
            }
        }
    }

    fn process(&mut self, entry: LogEntry) {
        self.stats.entries += 1;

        if let Some(event) = self.extractor.extract(&entry) {
            let outcome = self.dispatcher.dispatch(&event);
            self.stats.alerts += 1;
            if !outcome.notified {
                self.stats.notify_failures += 1;
            }
            if !outcome.logged {
                self.stats.log_failures += 1;
            }
        }

        if let Err(e) = self.tracker.advance(entry.sequence_token) {
            log::warn!("Cursor not committed: {}", e);
        }
    }

    fn fail(&mut self, e: SourceError) -> EngineError {
        log::error!("Detection stopped: {}", e);
        self.dispatcher.record(&format!("Detection stopped: {}", e));
        self.state = LoopState::Stopped(StopReason::Error(e.to_string()));
        EngineError::Source(e)
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // nobody can ask for a stop any more
            std::future::pending::<()>().await;
        }
    }
}

/// Log source for the platform
pub fn source_for(platform: Platform, config: &DetectionConfig) -> AuthLogSource {
    let policy = RespawnPolicy::from_config(config);
    match platform {
        Platform::Linux => AuthLogSource::Journal(JournalSource::new(
            JournalctlTransport::new(config.journal_units.clone()),
            policy,
        )),
        Platform::Windows => AuthLogSource::EventLog(EventLogSource::new(
            WevtSecurityLog::default(),
            config.poll_interval(),
            policy,
        )),
    }
}

/// Dispatcher wired to the platform's notifier and the configured audit log
pub fn dispatcher_for(platform: Option<Platform>, config: &Config) -> AlertDispatcher {
    AlertDispatcher::new(
        config.notifications.title.clone(),
        notifier_for(platform, &config.notifications),
        audit_log_for(&config.logging),
    )
}

/// Build the session for the platform, unless it is switched off
pub fn detection_loop_for(
    platform: Platform,
    config: &Config,
) -> Result<DetectionLoop<AuthLogSource>, EngineError> {
    if !config.detection.platform_enabled(platform) {
        return Err(EngineError::Disabled(platform));
    }
    Ok(DetectionLoop::new(
        source_for(platform, &config.detection),
        dispatcher_for(Some(platform), config),
    ))
}

/// Run one session on the current thread until Ctrl+C, SIGTERM or a
/// terminal source error
pub fn serve(platform: Platform, config: &Config) -> Result<LoopStats, ServeError> {
    let mut detection = detection_loop_for(platform, config)?;

    if let Err(e) = checker_for(platform, &config.detection).check() {
        detection
            .dispatcher
            .record(&format!("Pre-flight check failed: {}", e));
        return Err(e.into());
    }

    let (stop, shutdown) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        let _ = stop.send(true);
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    log::info!("Daemon running. Press Ctrl+C to stop.");
    Ok(runtime.block_on(detection.run(shutdown))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{Notifier, SinkError};
    use crate::input::{FollowStream, JournalTransport};
    use crate::models::{Cursor, JournalCursor};
    use crate::output::AuditLog;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};

    #[derive(Clone, Default)]
    struct Sink {
        lines: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Sink {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        fn push(&self, line: &str) -> Result<(), SinkError> {
            self.lines.lock().unwrap().push(line.to_string());
            if self.fail {
                return Err(SinkError::Command {
                    program: "sink".into(),
                    detail: "down".into(),
                });
            }
            Ok(())
        }
    }

    impl Notifier for Sink {
        fn notify(&self, _title: &str, message: &str) -> Result<(), SinkError> {
            self.push(message)
        }
    }

    impl AuditLog for Sink {
        fn append(&self, message: &str) -> Result<(), SinkError> {
            self.push(message)
        }
    }

    /// Hands out scripted entries, then asks for shutdown and blocks
    struct ScriptedSource {
        platform: Platform,
        open_result: Option<SourceError>,
        entries: VecDeque<Result<LogEntry, SourceError>>,
        stop: watch::Sender<bool>,
        opened_with: Option<Option<Cursor>>,
        closed: bool,
    }

    impl ScriptedSource {
        fn new(
            platform: Platform,
            entries: Vec<Result<LogEntry, SourceError>>,
        ) -> (Self, watch::Receiver<bool>) {
            let (stop, rx) = watch::channel(false);
            let source = ScriptedSource {
                platform,
                open_result: None,
                entries: entries.into(),
                stop,
                opened_with: None,
                closed: false,
            };
            (source, rx)
        }
    }

    impl SourceReader for ScriptedSource {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn open(&mut self, start: Option<Cursor>) -> Result<(), SourceError> {
            self.opened_with = Some(start);
            match self.open_result.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn next_entry(&mut self) -> Result<LogEntry, SourceError> {
            match self.entries.pop_front() {
                Some(entry) => entry,
                None => {
                    let _ = self.stop.send(true);
                    std::future::pending().await
                }
            }
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn text(seq: u64, message: &str) -> Result<LogEntry, SourceError> {
        Ok(LogEntry {
            raw_message: message.to_string(),
            fields: None,
            sequence_token: Cursor::Record(seq),
            received_at: Utc::now(),
        })
    }

    fn dispatcher(notifier: &Sink, log: &Sink) -> AlertDispatcher {
        AlertDispatcher::new("Intrusion Alert", Box::new(notifier.clone()), Box::new(log.clone()))
    }

    #[tokio::test]
    async fn test_detects_and_commits_every_entry() {
        let (source, shutdown) = ScriptedSource::new(
            Platform::Linux,
            vec![
                text(1, "Failed password for invalid user root from 10.0.0.5 port 22 ssh2"),
                text(2, "Accepted password for alice from 10.0.0.9 port 22 ssh2"),
                text(3, "Failed password for bob from 10.0.0.7 port 22 ssh2"),
                text(4, "pam_unix(sshd:session): session closed for user alice"),
            ],
        );
        let notifier = Sink::default();
        let log = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&notifier, &log));

        let stats = detection.run(shutdown).await.unwrap();

        assert_eq!(stats.entries, 4);
        assert_eq!(stats.alerts, 2);
        assert_eq!(
            notifier.lines(),
            vec![
                "Failed SSH login - user=root, ip=10.0.0.5",
                "Failed SSH login - user=bob, ip=10.0.0.7",
            ]
        );
        assert_eq!(
            log.lines(),
            vec![
                "Linux detection started",
                "Failed SSH login - user=root, ip=10.0.0.5",
                "Failed SSH login - user=bob, ip=10.0.0.7",
                "Linux detection stopped",
            ]
        );
        // the trailing non-matching entry still moved the cursor
        assert_eq!(detection.tracker().current(), Some(&Cursor::Record(4)));
        assert_eq!(detection.state(), &LoopState::Stopped(StopReason::Clean));
        assert!(detection.source.closed);
        assert_eq!(detection.source.opened_with, Some(None));
    }

    #[tokio::test]
    async fn test_windows_records() {
        let mut fields = vec![String::new(); 20];
        fields[5] = "alice".to_string();
        fields[19] = "192.168.1.10".to_string();
        let record = |seq: u64, fields: Option<Vec<String>>| {
            Ok(LogEntry {
                raw_message: String::new(),
                fields,
                sequence_token: Cursor::Record(seq),
                received_at: Utc::now(),
            })
        };

        let (source, shutdown) = ScriptedSource::new(
            Platform::Windows,
            vec![record(10, Some(fields)), record(11, Some(vec!["x".to_string(); 3]))],
        );
        let notifier = Sink::default();
        let log = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&notifier, &log));

        detection.run(shutdown).await.unwrap();

        assert_eq!(
            notifier.lines(),
            vec![
                "Failed Windows logon - user=alice, ip=192.168.1.10",
                "Failed Windows logon - user=Unknown, ip=Unknown",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_sinks_do_not_stop_loop() {
        let (source, shutdown) = ScriptedSource::new(
            Platform::Linux,
            vec![
                text(1, "Failed password for a from 1.1.1.1"),
                text(2, "Failed password for b from 2.2.2.2"),
            ],
        );
        let notifier = Sink { fail: true, ..Default::default() };
        let log = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&notifier, &log));

        let stats = detection.run(shutdown).await.unwrap();

        assert_eq!(stats.alerts, 2);
        assert_eq!(stats.notify_failures, 2);
        assert_eq!(stats.log_failures, 0);
        assert_eq!(log.lines().len(), 4);
        assert_eq!(detection.tracker().current(), Some(&Cursor::Record(2)));
    }

    #[tokio::test]
    async fn test_open_failure_stops_with_error() {
        let (mut source, shutdown) = ScriptedSource::new(Platform::Linux, vec![]);
        source.open_result = Some(SourceError::Unavailable("journalctl missing".into()));
        let notifier = Sink::default();
        let log = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&notifier, &log));

        let err = detection.run(shutdown).await.unwrap_err();

        assert!(matches!(err, EngineError::Source(SourceError::Unavailable(_))));
        assert!(matches!(detection.state(), LoopState::Stopped(StopReason::Error(_))));
        assert!(notifier.lines().is_empty());
        assert_eq!(log.lines().len(), 1);
        assert!(log.lines()[0].starts_with("Detection stopped"));
    }

    #[tokio::test]
    async fn test_terminal_source_error_keeps_committed_progress() {
        let (source, shutdown) = ScriptedSource::new(
            Platform::Linux,
            vec![
                text(1, "Failed password for a from 1.1.1.1"),
                Err(SourceError::RespawnExhausted { attempts: 8 }),
                text(2, "never read"),
            ],
        );
        let notifier = Sink::default();
        let log = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&notifier, &log));

        let err = detection.run(shutdown).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Source(SourceError::RespawnExhausted { attempts: 8 })
        ));
        assert_eq!(detection.tracker().current(), Some(&Cursor::Record(1)));
        assert_eq!(notifier.lines().len(), 1);
        assert!(detection.source.closed);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_entry() {
        let (source, shutdown) =
            ScriptedSource::new(Platform::Linux, vec![text(1, "Failed password for a from 1.1.1.1")]);
        source.stop.send(true).unwrap();
        let notifier = Sink::default();
        let log = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&notifier, &log));

        let stats = detection.run(shutdown).await.unwrap();

        assert_eq!(stats.entries, 0);
        assert!(notifier.lines().is_empty());
        assert_eq!(detection.state(), &LoopState::Stopped(StopReason::Clean));
    }

    #[tokio::test]
    async fn test_stopped_loop_cannot_rerun() {
        let (source, shutdown) = ScriptedSource::new(Platform::Linux, vec![]);
        let sink = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&sink, &sink));

        detection.run(shutdown.clone()).await.unwrap();
        assert!(matches!(
            detection.run(shutdown).await,
            Err(EngineError::AlreadyRan)
        ));
    }

    /// Journal whose first follower dies mid-stream
    struct FlakyJournal {
        sessions: VecDeque<Vec<String>>,
        after: Arc<Mutex<Vec<Option<String>>>>,
        live: Vec<DuplexStream>,
        stop: watch::Sender<bool>,
    }

    impl JournalTransport for FlakyJournal {
        async fn tail_cursor(&mut self) -> Result<Option<JournalCursor>, SourceError> {
            Ok(Some(JournalCursor::new("s=j;i=a")))
        }

        async fn follow(&mut self, after: Option<&JournalCursor>) -> Result<FollowStream, SourceError> {
            self.after.lock().unwrap().push(after.map(|c| c.as_str().to_string()));
            let (reader, mut writer) = tokio::io::duplex(64 * 1024);
            match self.sessions.pop_front() {
                Some(lines) => {
                    for line in lines {
                        writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
                    }
                }
                None => {
                    // script exhausted: stay silent until the test stops the loop
                    let _ = self.stop.send(true);
                    self.live.push(writer);
                }
            }
            Ok(FollowStream::from_reader(BufReader::new(reader)))
        }
    }

    fn journal_line(seq: u64, message: &str) -> String {
        serde_json::json!({ "__CURSOR": format!("s=j;i={:x}", seq), "MESSAGE": message }).to_string()
    }

    #[tokio::test]
    async fn test_journal_crash_resumes_without_duplicates() {
        let (stop, shutdown) = watch::channel(false);
        let follows = Arc::new(Mutex::new(Vec::new()));
        let transport = FlakyJournal {
            sessions: VecDeque::from(vec![
                vec![
                    journal_line(0xb, "Failed password for root from 10.0.0.1 port 22 ssh2"),
                    journal_line(0xc, "Failed password for admin from 10.0.0.2 port 22 ssh2"),
                ],
                vec![
                    journal_line(0xc, "Failed password for admin from 10.0.0.2 port 22 ssh2"),
                    journal_line(0xd, "Failed password for guest from 10.0.0.3 port 22 ssh2"),
                ],
            ]),
            after: follows.clone(),
            live: Vec::new(),
            stop,
        };
        let source = JournalSource::new(transport, RespawnPolicy::immediate(3));
        let notifier = Sink::default();
        let log = Sink::default();
        let mut detection = DetectionLoop::new(source, dispatcher(&notifier, &log));

        let stats = detection.run(shutdown).await.unwrap();

        assert_eq!(stats.alerts, 3);
        assert_eq!(
            notifier.lines(),
            vec![
                "Failed SSH login - user=root, ip=10.0.0.1",
                "Failed SSH login - user=admin, ip=10.0.0.2",
                "Failed SSH login - user=guest, ip=10.0.0.3",
            ]
        );
        assert_eq!(
            detection.tracker().current(),
            Some(&Cursor::Journal(JournalCursor::new("s=j;i=d")))
        );
        // each follower starts after the last committed entry
        assert_eq!(
            *follows.lock().unwrap(),
            vec![
                Some("s=j;i=a".to_string()),
                Some("s=j;i=c".to_string()),
                Some("s=j;i=d".to_string()),
            ]
        );
    }

    #[test]
    fn test_factory_selects_source_per_platform() {
        let config = Config::default();
        assert!(matches!(
            source_for(Platform::Linux, &config.detection),
            AuthLogSource::Journal(_)
        ));
        let windows = detection_loop_for(Platform::Windows, &config).unwrap();
        assert!(matches!(windows.source, AuthLogSource::EventLog(_)));
        assert_eq!(windows.extractor.platform(), Platform::Windows);
        assert_eq!(windows.state(), &LoopState::Idle);
    }

    #[test]
    fn test_serve_stops_before_preflight_when_disabled() {
        let mut config = Config::default();
        config.detection.windows_enabled = false;
        config.logging.enabled = false;

        let err = serve(Platform::Windows, &config).unwrap_err();
        assert!(matches!(
            err,
            ServeError::Engine(EngineError::Disabled(Platform::Windows))
        ));
    }

    #[test]
    fn test_factory_refuses_disabled_platform() {
        let mut config = Config::default();
        config.detection.linux_enabled = false;

        let err = detection_loop_for(Platform::Linux, &config).err().unwrap();
        assert!(matches!(err, EngineError::Disabled(Platform::Linux)));
        assert_eq!(err.to_string(), "Linux detection is disabled in the configuration");
        assert!(detection_loop_for(Platform::Windows, &config).is_ok());
    }
}
