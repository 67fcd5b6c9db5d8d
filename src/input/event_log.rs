//! Windows security event log source
//!
//! Polls the Security log for failed logons (event 4625). Records are
//! identified by their record number, which only ever grows, so the
//! reader remembers the highest number seen and ignores anything at or
//! below it.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use super::{RespawnPolicy, SourceError, SourceReader};
use crate::models::{Cursor, LogEntry, Platform};

/// Event id of a failed logon
pub const FAILED_LOGON_EVENT_ID: u32 = 4625;

/// Records fetched per poll at most
pub const MAX_EVENTS_PER_POLL: u32 = 500;

/// One record read from the security log
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityRecord {
    pub record_number: u64,
    pub event_id: u32,
    pub time_created: Option<DateTime<Utc>>,
    /// Insertion strings of the event, in template order
    pub insertion_strings: Option<Vec<String>>,
}

impl SecurityRecord {
    pub fn into_entry(self) -> LogEntry {
        LogEntry {
            raw_message: format!("event {} record {}", self.event_id, self.record_number),
            fields: self.insertion_strings,
            sequence_token: Cursor::Record(self.record_number),
            received_at: self.time_created.unwrap_or_else(Utc::now),
        }
    }
}

/// Handle on the security log
#[allow(async_fn_in_trait)]
pub trait SecurityLog {
    /// Acquire the log, returning its newest record number
    async fn open(&mut self) -> Result<u64, SourceError>;

    /// Records with a record number above `after`, oldest first
    async fn read_after(&mut self, after: u64) -> Result<Vec<SecurityRecord>, SourceError>;
}

/// Polling reader over the security log
pub struct EventLogSource<L> {
    log: L,
    poll_interval: Duration,
    target_event_id: u32,
    last_record: u64,
    pending: VecDeque<SecurityRecord>,
    policy: RespawnPolicy,
    failures: u32,
}

impl<L: SecurityLog> EventLogSource<L> {
    pub fn new(log: L, poll_interval: Duration, policy: RespawnPolicy) -> Self {
        EventLogSource {
            log,
            poll_interval,
            target_event_id: FAILED_LOGON_EVENT_ID,
            last_record: 0,
            pending: VecDeque::new(),
            policy,
            failures: 0,
        }
    }

    /// Highest record number seen so far
    pub fn last_record(&self) -> u64 {
        self.last_record
    }

    fn absorb(&mut self, mut records: Vec<SecurityRecord>) {
        records.sort_by_key(|r| r.record_number);

        let mut newest = self.last_record;
        for record in records {
            if record.record_number <= self.last_record {
                continue;
            }
            newest = newest.max(record.record_number);
            if record.event_id == self.target_event_id {
                self.pending.push_back(record);
            }
        }
        self.last_record = newest;
    }
}

impl<L: SecurityLog> SourceReader for EventLogSource<L> {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    async fn open(&mut self, start: Option<Cursor>) -> Result<(), SourceError> {
        let newest = self.log.open().await?;

        self.last_record = match start {
            Some(Cursor::Record(number)) => number,
            Some(other) => return Err(SourceError::CursorMismatch(other.to_string())),
            None => newest,
        };
        self.pending.clear();
        self.failures = 0;

        log::info!(
            "Watching Security log for event {} after record {}",
            self.target_event_id,
            self.last_record
        );
        Ok(())
    }

    async fn next_entry(&mut self) -> Result<LogEntry, SourceError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(record.into_entry());
            }

            match self.log.read_after(self.last_record).await {
                Ok(records) => {
                    self.failures = 0;
                    self.absorb(records);
                }
                Err(e) => {
                    self.failures += 1;
                    if self.policy.exhausted(self.failures) {
                        return Err(SourceError::RespawnExhausted {
                            attempts: self.policy.max_attempts(),
                        });
                    }
                    log::warn!("Security log read failed: {}", e);
                    tokio::time::sleep(self.policy.delay_for(self.failures)).await;
                    continue;
                }
            }

            if self.pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn close(&mut self) {
        self.pending.clear();
    }
}
