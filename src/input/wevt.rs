//! Security log access through the Windows Event Log API
//!
//! Each poll runs an `EvtQuery` over the Security channel filtered to the
//! target event id and to record numbers above the last one seen, drains it
//! with `EvtNext` and renders every event to XML. The XML parsing is plain
//! text work and is shared with offline extraction of `wevtutil qe /f:xml`
//! exports.

use chrono::{DateTime, Utc};
use regex::Regex;

use super::event_log::{SecurityLog, SecurityRecord, FAILED_LOGON_EVENT_ID, MAX_EVENTS_PER_POLL};
use super::SourceError;

/// Channel holding logon audit events
pub const SECURITY_CHANNEL: &str = "Security";

const ERROR_NO_MORE_ITEMS: u32 = 259;
const ERROR_TIMEOUT: u32 = 1460;

/// XPath selecting `event_id` records numbered above `after`
pub fn security_query(event_id: u32, after: u64) -> String {
    format!(
        "*[System[(EventID={}) and (EventRecordID > {})]]",
        event_id, after
    )
}

/// Map the error code of a failed `EvtNext` call
///
/// Running out of events, or of time waiting for more, only ends the
/// current batch.
pub fn next_failure(code: u32) -> Result<(), SourceError> {
    match code {
        0 | ERROR_NO_MORE_ITEMS | ERROR_TIMEOUT => Ok(()),
        code => Err(SourceError::Unavailable(format!(
            "EvtNext failed with error {}",
            code
        ))),
    }
}

/// Lightweight parser for rendered event XML
pub struct EventXmlParser {
    event: Regex,
    record_id: Regex,
    event_id: Regex,
    time_created: Regex,
    event_data: Regex,
    data: Regex,
}

impl EventXmlParser {
    pub fn new() -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("static pattern is valid");
        EventXmlParser {
            event: compile(r"(?s)<Event\b.*?</Event>"),
            record_id: compile(r"<EventRecordID>\s*(\d+)\s*</EventRecordID>"),
            event_id: compile(r"<EventID\b[^>]*>\s*(\d+)\s*</EventID>"),
            time_created: compile(r#"<TimeCreated\s+SystemTime=['"]([^'"]+)['"]"#),
            event_data: compile(r"(?s)<EventData\b[^>]*?(?:/>|>(.*?)</EventData>)"),
            data: compile(r"(?s)<Data\b[^>]*?(?:/>|>(.*?)</Data>)"),
        }
    }

    /// Parse one `<Event>` element
    ///
    /// Returns `None` when the record number or event id is missing.
    pub fn parse(&self, xml: &str) -> Option<SecurityRecord> {
        let record_number = self.record_id.captures(xml)?[1].parse().ok()?;
        let event_id = self.event_id.captures(xml)?[1].parse().ok()?;

        let time_created = self
            .time_created
            .captures(xml)
            .and_then(|caps| DateTime::parse_from_rfc3339(&caps[1]).ok())
            .map(|t| t.with_timezone(&Utc));

        let insertion_strings = self.event_data.captures(xml).map(|section| {
            let body = section.get(1).map_or("", |m| m.as_str());
            self.data
                .captures_iter(body)
                .map(|data| unescape(data.get(1).map_or("", |m| m.as_str()).trim()))
                .collect()
        });

        Some(SecurityRecord {
            record_number,
            event_id,
            time_created,
            insertion_strings,
        })
    }

    /// Parse every `<Event>` element of an export, skipping broken ones
    pub fn parse_all(&self, contents: &str) -> Vec<SecurityRecord> {
        self.event
            .find_iter(contents)
            .filter_map(|event| {
                let record = self.parse(event.as_str());
                if record.is_none() {
                    log::debug!("Skipping event without record number or event id");
                }
                record
            })
            .collect()
    }

    /// Newest record number, given the first event of a newest-first query
    pub fn newest_record(&self, first: Option<&str>) -> Result<u64, SourceError> {
        match first {
            None => Ok(0),
            Some(xml) => self
                .record_id
                .captures(xml)
                .and_then(|caps| caps[1].parse().ok())
                .ok_or_else(|| SourceError::Decode("newest event has no record number".to_string())),
        }
    }
}

impl Default for EventXmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// [`SecurityLog`] over the native Event Log API
pub struct WevtSecurityLog {
    event_id: u32,
    parser: EventXmlParser,
}

impl WevtSecurityLog {
    pub fn new(event_id: u32) -> Self {
        WevtSecurityLog {
            event_id,
            parser: EventXmlParser::new(),
        }
    }
}

impl Default for WevtSecurityLog {
    fn default() -> Self {
        Self::new(FAILED_LOGON_EVENT_ID)
    }
}

async fn run_blocking<T, F>(job: F) -> Result<T, SourceError>
where
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| SourceError::Unavailable(format!("event log worker failed: {}", e)))?
}

impl SecurityLog for WevtSecurityLog {
    async fn open(&mut self) -> Result<u64, SourceError> {
        let first = run_blocking(|| imp::newest_event_xml(SECURITY_CHANNEL)).await?;
        self.parser.newest_record(first.as_deref())
    }

    async fn read_after(&mut self, after: u64) -> Result<Vec<SecurityRecord>, SourceError> {
        let query = security_query(self.event_id, after);
        let events =
            run_blocking(move || imp::query_xml(SECURITY_CHANNEL, &query, MAX_EVENTS_PER_POLL))
                .await?;

        Ok(events
            .iter()
            .filter_map(|xml| {
                let record = self.parser.parse(xml);
                if record.is_none() {
                    log::debug!("Skipping unparseable Security event");
                }
                record
            })
            .collect())
    }
}

#[cfg(windows)]
mod imp {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::System::EventLog::*;

    use super::next_failure;
    use crate::input::SourceError;

    const BATCH: usize = 10;
    const NEXT_TIMEOUT_MS: u32 = 1000;

    /// Event log handle closed on drop
    struct Handle(EVT_HANDLE);

    impl Drop for Handle {
        fn drop(&mut self) {
            let _ = unsafe { EvtClose(self.0) };
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        OsStr::new(s)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    fn query(channel: &str, xpath: &str, flags: u32) -> Result<Handle, SourceError> {
        let channel_wide = to_wide(channel);
        let xpath_wide = to_wide(xpath);

        let handle = unsafe {
            EvtQuery(
                EVT_HANDLE::default(),
                PCWSTR(channel_wide.as_ptr()),
                PCWSTR(xpath_wide.as_ptr()),
                flags,
            )
        }
        .map_err(|e| SourceError::Unavailable(format!("cannot query {} log: {}", channel, e)))?;

        if handle.is_invalid() {
            return Err(SourceError::Unavailable(format!(
                "invalid query handle for {} log",
                channel
            )));
        }
        Ok(Handle(handle))
    }

    fn render_xml(event: &Handle) -> Result<String, String> {
        let mut required = 0u32;
        let mut properties = 0u32;

        // sizing call, expected to fail with ERROR_INSUFFICIENT_BUFFER
        let _ = unsafe {
            EvtRender(
                EVT_HANDLE::default(),
                event.0,
                EvtRenderEventXml.0,
                0,
                None,
                &mut required,
                &mut properties,
            )
        };
        if required == 0 {
            return Err("EvtRender sizing call returned 0".to_string());
        }

        let mut buffer = vec![0u16; (required as usize).div_ceil(2) + 1];
        let mut used = 0u32;
        unsafe {
            EvtRender(
                EVT_HANDLE::default(),
                event.0,
                EvtRenderEventXml.0,
                (buffer.len() * 2) as u32,
                Some(buffer.as_mut_ptr() as *mut _),
                &mut used,
                &mut properties,
            )
        }
        .map_err(|e| format!("EvtRender failed: {}", e))?;

        let len = (used as usize / 2).min(buffer.len());
        Ok(String::from_utf16_lossy(&buffer[..len])
            .trim_end_matches('\0')
            .to_string())
    }

    /// Render up to `limit` events of a result set
    fn drain(results: &Handle, limit: usize) -> Result<Vec<String>, SourceError> {
        let mut rendered = Vec::new();

        while rendered.len() < limit {
            let wanted = BATCH.min(limit - rendered.len());
            let mut events = [0isize; BATCH];
            let mut returned = 0u32;

            let next = unsafe {
                EvtNext(
                    results.0,
                    &mut events[..wanted],
                    NEXT_TIMEOUT_MS,
                    0,
                    &mut returned,
                )
            };
            if next.is_err() {
                let code = unsafe { windows::Win32::Foundation::GetLastError() };
                next_failure(code.0)?;
                break;
            }

            for &raw in events.iter().take(returned as usize) {
                let event = Handle(EVT_HANDLE(raw));
                match render_xml(&event) {
                    Ok(xml) => rendered.push(xml),
                    Err(e) => log::debug!("Skipping event that failed to render: {}", e),
                }
            }

            if (returned as usize) < wanted {
                break;
            }
        }

        Ok(rendered)
    }

    pub fn newest_event_xml(channel: &str) -> Result<Option<String>, SourceError> {
        let results = query(
            channel,
            "*",
            EvtQueryChannelPath.0 | EvtQueryReverseDirection.0,
        )?;
        Ok(drain(&results, 1)?.into_iter().next())
    }

    pub fn query_xml(channel: &str, xpath: &str, limit: u32) -> Result<Vec<String>, SourceError> {
        let results = query(
            channel,
            xpath,
            EvtQueryChannelPath.0 | EvtQueryForwardDirection.0,
        )?;
        drain(&results, limit as usize)
    }
}

#[cfg(not(windows))]
mod imp {
    use crate::input::SourceError;

    fn unsupported() -> SourceError {
        SourceError::Unavailable("the Windows Event Log API requires Windows".to_string())
    }

    pub fn newest_event_xml(_channel: &str) -> Result<Option<String>, SourceError> {
        Err(unsupported())
    }

    pub fn query_xml(
        _channel: &str,
        _xpath: &str,
        _limit: u32,
    ) -> Result<Vec<String>, SourceError> {
        Err(unsupported())
    }
}
