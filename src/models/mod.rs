pub mod cursor;
pub mod event;

pub use cursor::{Cursor, JournalCursor};
pub use event::{AuthFailureEvent, LogEntry, Platform, UNKNOWN};
