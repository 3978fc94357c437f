//! Response output host functions.

use crate::context;
use crate::error::Result;

/// Write body bytes to the bound worker's client.
///
/// Nothing is buffered; the returned count is what the host accepted.
pub fn write_body(bytes: &[u8]) -> Result<usize> {
    let (worker_id, host) = context::host()?;
    let written = host.write_output(worker_id, bytes);
    if written < bytes.len() {
        tracing::debug!(worker_id, requested = bytes.len(), written, "Short body write");
    }
    Ok(written)
}

/// Forward one formatted header line to the bound worker.
///
/// `None` is accepted and ignored once the context check has passed.
pub fn send_header(line: Option<&[u8]>) -> Result<()> {
    let (worker_id, host) = context::host()?;
    if let Some(line) = line {
        host.send_header(worker_id, line);
    }
    Ok(())
}
