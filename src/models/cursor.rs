//! Stream positions
//!
//! A cursor marks the last entry consumed from a log source. Journal
//! cursors are opaque strings handed out by journald; the Windows security
//! log uses monotonically increasing record numbers.

use std::cmp::Ordering;
use std::fmt;

/// Opaque journald cursor
///
/// The text is kept verbatim so it can be handed back to `journalctl
/// --after-cursor`. The `s=` (sequence id) and `i=` (sequence number)
/// components are parsed when present to give cursors from the same
/// journal a total order.
#[derive(Debug, Clone)]
pub struct JournalCursor {
    raw: String,
    seqnum_id: Option<String>,
    seqnum: Option<u64>,
}

impl JournalCursor {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let mut seqnum_id = None;
        let mut seqnum = None;

        for part in raw.split(';') {
            if let Some(id) = part.strip_prefix("s=") {
                seqnum_id = Some(id.to_string());
            } else if let Some(num) = part.strip_prefix("i=") {
                seqnum = u64::from_str_radix(num, 16).ok();
            }
        }

        JournalCursor { raw, seqnum_id, seqnum }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `self` was produced after `other`
    ///
    /// Cursors that cannot be ordered by sequence number (for example
    /// after journal rotation changed the sequence id) are taken in
    /// stream order: the newly observed one is after.
    pub fn is_after(&self, other: &JournalCursor) -> bool {
        match self.partial_cmp(other) {
            Some(ordering) => ordering == Ordering::Greater,
            None => true,
        }
    }
}

/// Two cursors naming the same entry are equal even when their other
/// components (boot id, timestamps) are printed differently.
impl PartialEq for JournalCursor {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl Eq for JournalCursor {}

impl PartialOrd for JournalCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.raw == other.raw {
            return Some(Ordering::Equal);
        }
        match (&self.seqnum_id, self.seqnum, &other.seqnum_id, other.seqnum) {
            (Some(a_id), Some(a), Some(b_id), Some(b)) if a_id == b_id => Some(a.cmp(&b)),
            _ => None,
        }
    }
}

/// Position in a log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Journal(JournalCursor),
    Record(u64),
}

impl Cursor {
    /// Whether `self` lies strictly after `other` in its stream
    ///
    /// Cursors of different sources are never after one another.
    pub fn is_after(&self, other: &Cursor) -> bool {
        match (self, other) {
            (Cursor::Journal(a), Cursor::Journal(b)) => a.is_after(b),
            (Cursor::Record(a), Cursor::Record(b)) => a > b,
            _ => false,
        }
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Cursor::Journal(a), Cursor::Journal(b)) => a.partial_cmp(b),
            (Cursor::Record(a), Cursor::Record(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Journal(c) => write!(f, "{}", c.as_str()),
            Cursor::Record(n) => write!(f, "record {}", n),
        }
    }
}
