//! Committed stream position for one detection session

use thiserror::Error;

use crate::models::Cursor;

#[derive(Error, Debug, PartialEq)]
pub enum CursorError {
    #[error("cursor {new} is before committed cursor {current}")]
    Regression { current: String, new: String },

    #[error("cursor {new} cannot be compared with committed cursor {current}")]
    Incomparable { current: String, new: String },
}

/// Tracks the last fully processed position of the active session
///
/// Only the detection loop advances it, and only once an entry has been
/// completely handled, so a reader restarted from `current()` never skips
/// unprocessed work.
#[derive(Debug, Default)]
pub struct CursorTracker {
    current: Option<Cursor>,
    commits: u64,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker with a known starting position
    pub fn starting_at(cursor: Option<Cursor>) -> Self {
        CursorTracker { current: cursor, commits: 0 }
    }

    /// Commit a new position
    ///
    /// Committing the current position again is a no-op. Moving backwards
    /// is rejected and leaves the committed value untouched.
    pub fn advance(&mut self, new_cursor: Cursor) -> Result<(), CursorError> {
        let Some(current) = &self.current else {
            self.current = Some(new_cursor);
            self.commits += 1;
            return Ok(());
        };

        if new_cursor == *current {
            return Ok(());
        }

        if new_cursor.is_after(current) {
            self.current = Some(new_cursor);
            self.commits += 1;
            return Ok(());
        }

        if new_cursor.partial_cmp(current).is_some() {
            Err(CursorError::Regression {
                current: current.to_string(),
                new: new_cursor.to_string(),
            })
        } else {
            Err(CursorError::Incomparable {
                current: current.to_string(),
                new: new_cursor.to_string(),
            })
        }
    }

    /// Last committed position, used to seed a reader restart
    pub fn current(&self) -> Option<&Cursor> {
        self.current.as_ref()
    }

    /// Number of commits that moved the cursor
    pub fn commits(&self) -> u64 {
        self.commits
    }
}
