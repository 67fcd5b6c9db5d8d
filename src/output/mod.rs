//! Durable audit log
//!
//! Append-only record of alerts and daemon lifecycle messages, written as
//! plain `[timestamp] message` lines or as JSON lines.

use chrono::Local;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::alerting::SinkError;
use crate::config::LoggingConfig;

/// Append-only sink for timestamped lines
pub trait AuditLog: Send {
    fn append(&self, message: &str) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Jsonl,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Jsonl
        } else {
            OutputFormat::Text
        }
    }
}

#[derive(Serialize)]
struct AuditLine<'a> {
    timestamp: String,
    message: &'a str,
}

/// Audit log backed by a file
///
/// The file is opened for every line so external rotation is picked up;
/// the parent directory is created on demand.
pub struct FileAuditLog {
    path: PathBuf,
    format: OutputFormat,
}

impl FileAuditLog {
    pub fn new(path: PathBuf, format: OutputFormat) -> Self {
        FileAuditLog { path, format }
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::new(config.file_path(), OutputFormat::from_json_flag(config.json_format))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(&self, message: &str) -> Result<String, SinkError> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let line = match self.format {
            OutputFormat::Text => format!("[{}] {}\n", timestamp, message),
            OutputFormat::Jsonl => {
                let json = serde_json::to_string(&AuditLine { timestamp, message })?;
                format!("{}\n", json)
            }
        };
        Ok(line)
    }
}

impl AuditLog for FileAuditLog {
    fn append(&self, message: &str) -> Result<(), SinkError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let line = self.render(message)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Audit log used when logging is disabled
pub struct NullAuditLog;

impl AuditLog for NullAuditLog {
    fn append(&self, _message: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Audit log selected by the configuration
pub fn audit_log_for(config: &LoggingConfig) -> Box<dyn AuditLog> {
    if config.enabled {
        Box::new(FileAuditLog::from_config(config))
    } else {
        Box::new(NullAuditLog)
    }
}
