//! Host-side interfaces.
//!
//! The host owns the worker slots, the client connections and the request
//! bodies. The bridge talks to it only through [`WorkerHost`], always naming
//! the worker a call is for.

pub mod request;
pub mod table;

use crate::context::WorkerId;
use serde::{Deserialize, Serialize};

pub use request::HostRequest;
pub use table::{common_log_line, HeaderLine, LogEntry, ResponseCapture, WorkerTable};

/// Worker-identified outbound sink implemented by the host
pub trait WorkerHost: Send + Sync {
    /// Write response body bytes, returning how many were accepted
    fn write_output(&self, worker_id: WorkerId, bytes: &[u8]) -> usize;

    /// Send one formatted header line (`HTTP/1.1 404 Not Found`, `Name: value`)
    fn send_header(&self, worker_id: WorkerId, header_line: &[u8]);

    /// Emit a diagnostic line for the worker
    fn log_message(&self, worker_id: WorkerId, message: &str, severity: Severity);

    /// Read up to `max_len` bytes of request body. An empty buffer means end of body.
    fn read_post(&self, worker_id: WorkerId, max_len: usize) -> Vec<u8>;
}

/// Syslog severity attached to engine log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// System is unusable
    Emergency = 0,
    /// Action must be taken immediately
    Alert = 1,
    /// Critical conditions
    Critical = 2,
    /// Error conditions
    Error = 3,
    /// Warning conditions
    Warning = 4,
    /// Normal but significant condition
    Notice = 5,
    /// Informational
    Info = 6,
    /// Debug-level messages
    Debug = 7,
}

impl Severity {
    /// Whether the line belongs in the host's error log
    pub fn is_error(self) -> bool {
        self <= Severity::Warning
    }

    /// Emit `message` as a tracing event at the matching level
    pub fn emit(self, worker_id: WorkerId, message: &str) {
        match self {
            Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => {
                tracing::error!(worker_id, severity = ?self, "{}", message)
            }
            Severity::Warning => tracing::warn!(worker_id, severity = ?self, "{}", message),
            Severity::Notice | Severity::Info => {
                tracing::info!(worker_id, severity = ?self, "{}", message)
            }
            Severity::Debug => tracing::debug!(worker_id, severity = ?self, "{}", message),
        }
    }
}

impl From<i32> for Severity {
    fn from(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Severity::Emergency,
            1 => Severity::Alert,
            2 => Severity::Critical,
            3 => Severity::Error,
            4 => Severity::Warning,
            5 => Severity::Notice,
            6 => Severity::Info,
            _ => Severity::Debug,
        }
    }
}
