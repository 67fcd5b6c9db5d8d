pub mod alerting;
pub mod config;
pub mod detection;
pub mod engine;
pub mod input;
pub mod models;
pub mod output;
pub mod preflight;

// Re-export commonly used types
pub use alerting::{AlertDispatcher, Notifier, SinkError};
pub use config::Config;
pub use detection::{CursorTracker, PatternExtractor};
pub use engine::{
    detection_loop_for, serve, DetectionLoop, EngineError, LoopState, ServeError, StopReason,
};
pub use input::{AuthLogSource, SourceError, SourceReader};
pub use models::{AuthFailureEvent, Cursor, LogEntry, Platform};
pub use output::AuditLog;
