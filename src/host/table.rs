//! Reference worker table.
//!
//! An in-process [`WorkerHost`] keyed by worker id. Each slot captures what
//! the engine produced for the request currently assigned to it and serves
//! that request's body. Embedders with their own HTTP stack can use it as is
//! or as a model for their own sink.

use super::{HostRequest, Severity, WorkerHost};
use crate::context::WorkerId;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::fmt::Display;

/// Status reported when the script never sent one
pub const DEFAULT_STATUS: u16 = 200;

/// Status substituted for out-of-range codes
pub const INVALID_STATUS_FALLBACK: u16 = 500;

/// A header line sent by the engine, after parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    /// `HTTP/x.y NNN reason`
    Status(u16),
    /// `Name: value`
    Field {
        /// Header name without the colon
        name: String,
        /// Everything after the first space
        value: String,
    },
    /// Anything else
    Ignored,
}

impl HeaderLine {
    /// Parse one engine header line.
    ///
    /// Status codes outside `100..600`, including unparsable ones, become 500.
    pub fn parse(line: &[u8]) -> Self {
        let line = String::from_utf8_lossy(line);
        let line: &str = &line;
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));

        if head.starts_with("HTTP/") {
            let code = rest.split(' ').next().unwrap_or("");
            let status = match code.parse::<u16>() {
                Ok(status) if (100..600).contains(&status) => status,
                _ => INVALID_STATUS_FALLBACK,
            };
            return HeaderLine::Status(status);
        }

        match head.strip_suffix(':') {
            Some(name) => HeaderLine::Field {
                name: name.to_string(),
                value: rest.to_string(),
            },
            None => HeaderLine::Ignored,
        }
    }
}

/// One diagnostic line captured for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Syslog severity
    pub severity: Severity,
    /// Message text
    pub message: String,
    /// When the line was received
    pub at: DateTime<Utc>,
}

/// Everything the engine produced for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseCapture {
    /// Status from the last status line, if any
    pub status: Option<u16>,
    /// Response headers; a repeated name replaces the earlier value
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
    /// Lines at `Warning` or more severe, in arrival order
    pub error_log: Vec<LogEntry>,
    /// All other lines, in arrival order
    pub info_log: Vec<LogEntry>,
}

impl ResponseCapture {
    /// Status to put on the wire
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(DEFAULT_STATUS)
    }

    /// Number of body bytes written
    pub fn bytes_written(&self) -> usize {
        self.body.len()
    }

    /// Look up a response header, ignoring ASCII case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn set_header(&mut self, name: String, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
    }
}

#[derive(Debug, Default)]
struct WorkerSlot {
    capture: ResponseCapture,
    post_body: Vec<u8>,
    post_cursor: usize,
}

/// Worker-id keyed response capture
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: DashMap<WorkerId, WorkerSlot>,
}

impl WorkerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with workers `0..count`
    pub fn with_workers(count: usize) -> Self {
        let table = Self::new();
        for id in 0..count {
            table.register(id as WorkerId);
        }
        table
    }

    /// Add a worker slot; an existing slot is reset
    pub fn register(&self, worker_id: WorkerId) {
        self.workers.insert(worker_id, WorkerSlot::default());
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is registered
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Assign a new request to a worker, replacing any previous capture.
    ///
    /// Returns false for unknown workers.
    pub fn begin_request(&self, worker_id: WorkerId, post_body: impl Into<Vec<u8>>) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(mut slot) => {
                *slot = WorkerSlot {
                    post_body: post_body.into(),
                    ..WorkerSlot::default()
                };
                true
            }
            None => {
                tracing::error!(worker_id, "Invalid worker id");
                false
            }
        }
    }

    /// Take the worker's capture and leave the slot idle
    pub fn finish_request(&self, worker_id: WorkerId) -> Option<ResponseCapture> {
        self.workers
            .get_mut(&worker_id)
            .map(|mut slot| std::mem::take(&mut *slot).capture)
    }

    /// Copy of the worker's current capture
    pub fn capture(&self, worker_id: WorkerId) -> Option<ResponseCapture> {
        self.workers.get(&worker_id).map(|slot| slot.capture.clone())
    }

    fn with_slot<R>(&self, worker_id: WorkerId, f: impl FnOnce(&mut WorkerSlot) -> R) -> Option<R> {
        match self.workers.get_mut(&worker_id) {
            Some(mut slot) => Some(f(&mut slot)),
            None => {
                tracing::error!(worker_id, "Invalid worker id");
                None
            }
        }
    }
}

impl WorkerHost for WorkerTable {
    fn write_output(&self, worker_id: WorkerId, bytes: &[u8]) -> usize {
        self.with_slot(worker_id, |slot| {
            slot.capture.body.extend_from_slice(bytes);
            bytes.len()
        })
        .unwrap_or(0)
    }

    fn send_header(&self, worker_id: WorkerId, header_line: &[u8]) {
        self.with_slot(worker_id, |slot| match HeaderLine::parse(header_line) {
            HeaderLine::Status(status) => slot.capture.status = Some(status),
            HeaderLine::Field { name, value } => slot.capture.set_header(name, value),
            HeaderLine::Ignored => {
                tracing::debug!(worker_id, line = %String::from_utf8_lossy(header_line), "Ignoring header line");
            }
        });
    }

    fn log_message(&self, worker_id: WorkerId, message: &str, severity: Severity) {
        self.with_slot(worker_id, |slot| {
            let entry = LogEntry {
                severity,
                message: message.to_string(),
                at: Utc::now(),
            };
            if severity.is_error() {
                slot.capture.error_log.push(entry);
            } else {
                slot.capture.info_log.push(entry);
            }
        });
    }

    fn read_post(&self, worker_id: WorkerId, max_len: usize) -> Vec<u8> {
        self.with_slot(worker_id, |slot| {
            let start = slot.post_cursor.min(slot.post_body.len());
            let end = start.saturating_add(max_len).min(slot.post_body.len());
            slot.post_cursor = end;
            slot.post_body[start..end].to_vec()
        })
        .unwrap_or_default()
    }
}

/// Format an NCSA Common Log Format line for a finished request
pub fn common_log_line<Tz>(request: &HostRequest, capture: &ResponseCapture, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "{} - - [{}] - \"{} {} {}\" {} {}",
        request.remote_addr,
        at.format("%d/%b/%Y:%H:%M:%S %z"),
        request.method,
        request.request_uri,
        request.protocol(),
        capture.status_code(),
        capture.bytes_written(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(HeaderLine::parse(b"HTTP/1.1 404 Not Found"), HeaderLine::Status(404));
        assert_eq!(HeaderLine::parse(b"HTTP/1.0 302"), HeaderLine::Status(302));
    }

    #[test]
    fn test_parse_out_of_range_status() {
        assert_eq!(HeaderLine::parse(b"HTTP/1.1 99 Odd"), HeaderLine::Status(500));
        assert_eq!(HeaderLine::parse(b"HTTP/1.1 600 Odd"), HeaderLine::Status(500));
        assert_eq!(HeaderLine::parse(b"HTTP/1.1 abc"), HeaderLine::Status(500));
        assert_eq!(HeaderLine::parse(b"HTTP/1.1"), HeaderLine::Status(500));
    }

    #[test]
    fn test_parse_field_line() {
        assert_eq!(
            HeaderLine::parse(b"Content-Type: text/html; charset=UTF-8"),
            HeaderLine::Field {
                name: "Content-Type".into(),
                value: "text/html; charset=UTF-8".into(),
            }
        );
        assert_eq!(HeaderLine::parse(b"NoColon value"), HeaderLine::Ignored);
        assert_eq!(HeaderLine::parse(b""), HeaderLine::Ignored);
    }

    #[test]
    fn test_table_captures_response() {
        let table = WorkerTable::with_workers(2);
        assert!(table.begin_request(1, Vec::new()));

        table.send_header(1, b"HTTP/1.1 201 Created");
        table.send_header(1, b"X-Powered-By: a");
        table.send_header(1, b"x-powered-by: b");
        assert_eq!(table.write_output(1, b"hello "), 6);
        assert_eq!(table.write_output(1, b"world"), 5);
        table.log_message(1, "notice", Severity::Notice);
        table.log_message(1, "deprecated", Severity::Warning);

        let capture = table.finish_request(1).unwrap();
        assert_eq!(capture.status_code(), 201);
        assert_eq!(capture.headers.len(), 1);
        assert_eq!(capture.header("X-Powered-By"), Some("b"));
        assert_eq!(capture.body, b"hello world".to_vec());
        assert_eq!(capture.info_log.len(), 1);
        assert_eq!(capture.info_log[0].severity, Severity::Notice);
        assert_eq!(capture.error_log.len(), 1);
        assert_eq!(capture.error_log[0].message, "deprecated");

        assert_eq!(table.capture(1).unwrap(), ResponseCapture::default());
        assert_eq!(table.capture(0).unwrap().status_code(), DEFAULT_STATUS);
    }

    #[test]
    fn test_table_unknown_worker_ignored() {
        let table = WorkerTable::with_workers(1);
        assert_eq!(table.write_output(5, b"lost"), 0);
        table.send_header(5, b"HTTP/1.1 500 Oops");
        assert!(table.read_post(5, 16).is_empty());
        assert!(!table.begin_request(5, Vec::new()));
        assert!(table.capture(5).is_none());
    }

    #[test]
    fn test_table_serves_post_body_in_chunks() {
        let table = WorkerTable::with_workers(1);
        table.begin_request(0, b"abcdefg".to_vec());

        assert_eq!(table.read_post(0, 3), b"abc".to_vec());
        assert_eq!(table.read_post(0, 3), b"def".to_vec());
        assert_eq!(table.read_post(0, 3), b"g".to_vec());
        assert!(table.read_post(0, 3).is_empty());
    }

    #[test]
    fn test_common_log_line() {
        let request = HostRequest::new("GET", "/index.php?a=1").with_remote_addr("10.0.0.1:5555");
        let capture = ResponseCapture {
            status: Some(404),
            body: vec![0; 12],
            ..ResponseCapture::default()
        };
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .unwrap();

        assert_eq!(
            common_log_line(&request, &capture, &at),
            "10.0.0.1:5555 - - [05/Mar/2024:14:07:09 +0000] - \"GET /index.php?a=1 HTTP/1.1\" 404 12"
        );
    }
}
