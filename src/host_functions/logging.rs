//! Logging host functions.
//!
//! Engine log lines go to the bound worker's host sink and are also emitted
//! as `tracing` events tagged with the worker id.

use crate::context;
use crate::error::Result;
use crate::host::Severity;

/// Longest engine error message passed on, in bytes
pub const ERROR_MESSAGE_LIMIT: usize = 4096;

/// Log a message for the bound worker
pub fn log_message(message: &str, severity: Severity) -> Result<()> {
    let (worker_id, host) = context::host()?;
    severity.emit(worker_id, message);
    host.log_message(worker_id, message, severity);
    Ok(())
}

/// Engine error hook.
///
/// The message is cut to [`ERROR_MESSAGE_LIMIT`] bytes and logged at
/// [`Severity::Error`].
pub fn report_error(error_type: i32, message: &str) -> Result<()> {
    let message = truncate(message, ERROR_MESSAGE_LIMIT);
    tracing::trace!(error_type, "Engine error reported");
    log_message(message, Severity::Error)
}

fn truncate(message: &str, limit: usize) -> &str {
    if message.len() <= limit {
        return message;
    }
    let mut end = limit;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
