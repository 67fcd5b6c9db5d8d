//! Failed-login signature matching
//!
//! Turns a raw log entry into at most one [`AuthFailureEvent`]. Entries
//! that do not carry the platform's failure signature yield `None`;
//! malformed input is never an error.

use regex::Regex;

use crate::models::{AuthFailureEvent, LogEntry, Platform, UNKNOWN};

/// sshd failure line, with or without the `invalid user` marker
const SSH_FAILURE_PATTERN: &str =
    r"Failed password for (?:invalid user )?(?P<user>\S+) from (?P<ip>[0-9A-Fa-f:.]+)";

/// Insertion string holding TargetUserName in a 4625 record
const TARGET_USER_INDEX: usize = 5;
/// Insertion string holding IpAddress in a 4625 record
const SOURCE_ADDRESS_INDEX: usize = 19;

/// Extracts failed logins for one platform
pub struct PatternExtractor {
    platform: Platform,
    ssh_failure: Regex,
}

impl PatternExtractor {
    pub fn new(platform: Platform) -> Self {
        PatternExtractor {
            platform,
            ssh_failure: Regex::new(SSH_FAILURE_PATTERN).expect("static pattern is valid"),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Extract a failure event from an entry, if it carries one
    pub fn extract(&self, entry: &LogEntry) -> Option<AuthFailureEvent> {
        let (user, source_ip) = match self.platform {
            Platform::Linux => self.match_ssh_failure(&entry.raw_message)?,
            Platform::Windows => Self::logon_failure_fields(entry.fields.as_deref()),
        };

        Some(AuthFailureEvent {
            user,
            source_ip,
            observed_at: entry.received_at,
            platform: self.platform,
        })
    }

    /// Match an sshd message, returning `(user, ip)`
    pub fn match_ssh_failure(&self, message: &str) -> Option<(String, String)> {
        let caps = self.ssh_failure.captures(message)?;
        Some((caps["user"].to_string(), caps["ip"].to_string()))
    }

    /// Pull user and address out of a 4625 record's insertion strings
    ///
    /// The event id was already filtered by the reader, so a record
    /// always produces an event; missing fields become "Unknown".
    pub fn logon_failure_fields(fields: Option<&[String]>) -> (String, String) {
        let field = |index: usize| {
            fields
                .and_then(|f| f.get(index))
                .cloned()
                .unwrap_or_else(|| UNKNOWN.to_string())
        };
        (field(TARGET_USER_INDEX), field(SOURCE_ADDRESS_INDEX))
    }
}
