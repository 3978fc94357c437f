//! Request input host functions: body, cookies and server variables.

use crate::codec;
use crate::context;
use crate::error::Result;

/// Read request body into `dest`, returning the number of bytes copied.
///
/// The host is asked for at most `dest.len()` bytes and never more than
/// that is copied. Zero means the body is exhausted.
pub fn read_post(dest: &mut [u8]) -> Result<usize> {
    let (worker_id, host) = context::host()?;
    let chunk = host.read_post(worker_id, dest.len());
    let copied = chunk.len().min(dest.len());
    if copied < chunk.len() {
        tracing::warn!(worker_id, offered = chunk.len(), copied, "Host returned more body than requested");
    }
    dest[..copied].copy_from_slice(&chunk[..copied]);
    Ok(copied)
}

/// Raw cookie header of the bound request, byte for byte
pub fn read_cookies() -> Result<Option<Vec<u8>>> {
    context::with_request(|request| request.cookie_data.clone())
}

/// Hand every server variable of the bound request to `registrar`.
///
/// Values are the exact payload bytes. Returns the number of variables.
pub fn register_variables(registrar: &mut dyn FnMut(&[u8], &[u8])) -> Result<usize> {
    context::with_variables(|blob| codec::decode(blob, |key, value| registrar(key, value)))?
}
