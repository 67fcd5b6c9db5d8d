//! Log sources
//!
//! A [`SourceReader`] turns a platform log transport into an endless
//! sequence of [`LogEntry`] values. Each variant owns its own recovery
//! policy: transient transport failures are absorbed internally and only
//! terminal failures reach the caller.

pub mod event_log;
pub mod journal;
pub mod respawn;
pub mod wevt;

pub use event_log::{EventLogSource, SecurityLog, SecurityRecord};
pub use journal::{FollowStream, JournalSource, JournalTransport, JournalctlTransport};
pub use respawn::RespawnPolicy;
pub use wevt::{EventXmlParser, WevtSecurityLog};

use thiserror::Error;

use crate::models::{Cursor, LogEntry, Platform};

/// Errors raised by log sources
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Log source unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Undecodable record: {0}")]
    Decode(String),

    #[error("Log transport still failing after {attempts} restarts")]
    RespawnExhausted { attempts: u32 },

    #[error("Starting cursor {0} does not belong to this source")]
    CursorMismatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A restartable stream of log entries
///
/// `open` positions the reader after `start` (or at the current tail when
/// `None`). `next_entry` blocks until the next entry is available; an
/// `Err` from it is terminal. Both futures may be dropped at an await
/// point without losing entries.
#[allow(async_fn_in_trait)]
pub trait SourceReader {
    /// Platform whose log this source reads
    fn platform(&self) -> Platform;

    /// Acquire the transport and position the reader
    async fn open(&mut self, start: Option<Cursor>) -> Result<(), SourceError>;

    /// Next entry strictly after everything already returned
    async fn next_entry(&mut self) -> Result<LogEntry, SourceError>;

    /// Release the underlying transport
    async fn close(&mut self);
}

/// Source chosen for the running platform
pub enum AuthLogSource {
    Journal(JournalSource<JournalctlTransport>),
    EventLog(EventLogSource<WevtSecurityLog>),
}

impl SourceReader for AuthLogSource {
    fn platform(&self) -> Platform {
        match self {
            AuthLogSource::Journal(source) => source.platform(),
            AuthLogSource::EventLog(source) => source.platform(),
        }
    }

    async fn open(&mut self, start: Option<Cursor>) -> Result<(), SourceError> {
        match self {
            AuthLogSource::Journal(source) => source.open(start).await,
            AuthLogSource::EventLog(source) => source.open(start).await,
        }
    }

    async fn next_entry(&mut self) -> Result<LogEntry, SourceError> {
        match self {
            AuthLogSource::Journal(source) => source.next_entry().await,
            AuthLogSource::EventLog(source) => source.next_entry().await,
        }
    }

    async fn close(&mut self) {
        match self {
            AuthLogSource::Journal(source) => source.close().await,
            AuthLogSource::EventLog(source) => source.close().await,
        }
    }
}
