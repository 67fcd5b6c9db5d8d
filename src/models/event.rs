use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Cursor;

/// Sentinel used when a field cannot be recovered from an entry
pub const UNKNOWN: &str = "Unknown";

/// Platform whose authentication log is being watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// Platform of the running process, if supported
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else {
            None
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "Linux"),
            Platform::Windows => write!(f, "Windows"),
        }
    }
}

/// One raw entry read from a log source
///
/// Text sources fill `raw_message`; the Windows security log fills
/// `fields` with the record's insertion strings.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub raw_message: String,
    pub fields: Option<Vec<String>>,
    pub sequence_token: Cursor,
    pub received_at: DateTime<Utc>,
}

/// A failed login extracted from a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailureEvent {
    pub user: String,
    pub source_ip: String,
    pub observed_at: DateTime<Utc>,
    pub platform: Platform,
}

impl AuthFailureEvent {
    /// Human readable alert line used for notifications and the audit log
    pub fn summary(&self) -> String {
        let what = match self.platform {
            Platform::Linux => "Failed SSH login",
            Platform::Windows => "Failed Windows logon",
        };
        format!("{} - user={}, ip={}", what, self.user, self.source_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_per_platform() {
        let mut event = AuthFailureEvent {
            user: "root".to_string(),
            source_ip: "10.0.0.5".to_string(),
            observed_at: Utc::now(),
            platform: Platform::Linux,
        };
        assert_eq!(event.summary(), "Failed SSH login - user=root, ip=10.0.0.5");

        event.platform = Platform::Windows;
        assert_eq!(event.summary(), "Failed Windows logon - user=root, ip=10.0.0.5");
    }
}
