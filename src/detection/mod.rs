pub mod cursor_tracker;
pub mod extractor;

pub use cursor_tracker::{CursorError, CursorTracker};
pub use extractor::PatternExtractor;
