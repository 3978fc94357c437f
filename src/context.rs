//! Per-request worker context.
//!
//! The engine's callback table carries no context parameter, so the bridge
//! parks the active request on the executing thread. A binding holds the
//! worker id, a borrowed view of the request's variable blob, the host sink
//! and the thread's request record. It exists only for the span of
//! [`enter`], and each thread holds at most one.
//!
//! This module also defines the request-scoped types that flow through
//! the bridge: [`RequestDescriptor`] in, [`RequestOutcome`] out.

use crate::error::{BridgeError, Result, ScriptError};
use crate::host::WorkerHost;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;
use uuid::Uuid;

/// Host worker slot identifier
pub type WorkerId = i32;

/// Default response code before the script changes it
pub const DEFAULT_RESPONSE_CODE: u16 = 200;

/// Everything the host hands over for one request.
///
/// Every field is moved into the bridge and released by it exactly once.
/// Byte fields may be any owned byte container, including buffers
/// allocated across the C ABI.
#[derive(Debug)]
pub struct RequestDescriptor<B = Vec<u8>> {
    /// Worker slot the request runs on
    pub worker_id: WorkerId,
    /// Protocol version as `major * 1000 + minor`
    pub proto_num: i32,
    /// Request method
    pub method: B,
    /// Raw request URI
    pub uri: B,
    /// Raw query string
    pub query: B,
    /// Encoded request headers
    pub header_blob: B,
    /// Encoded server variables
    pub variable_blob: B,
}

impl<B: AsRef<[u8]>> RequestDescriptor<B> {
    /// Create a new descriptor
    pub fn new(
        worker_id: WorkerId,
        proto_num: i32,
        method: impl Into<B>,
        uri: impl Into<B>,
        query: impl Into<B>,
        header_blob: B,
        variable_blob: B,
    ) -> Self {
        Self {
            worker_id,
            proto_num,
            method: method.into(),
            uri: uri.into(),
            query: query.into(),
            header_blob,
            variable_blob,
        }
    }
}

/// The engine's request record for the executing thread.
///
/// Request line parts and header values are kept as the raw bytes the host
/// sent; nothing is decoded or re-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Correlation id for logs
    pub request_id: Uuid,
    /// Response status; the script may change it
    pub response_code: u16,
    /// Protocol version as `major * 1000 + minor`
    pub proto_num: i32,
    /// Request method
    pub method: Vec<u8>,
    /// Raw request URI
    pub uri: Vec<u8>,
    /// Raw query string
    pub query_string: Vec<u8>,
    /// `Content-Type` header
    pub content_type: Option<Vec<u8>>,
    /// `Content-Length` header
    pub content_length: i64,
    /// Raw `Cookie` header, parsed by the engine
    pub cookie_data: Option<Vec<u8>>,
    /// Raw `Authorization` header
    pub authorization: Option<Vec<u8>>,
    /// Every other header, in arrival order
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl RequestRecord {
    /// Create a fresh record with the default response code
    pub fn new(
        proto_num: i32,
        method: impl Into<Vec<u8>>,
        uri: impl Into<Vec<u8>>,
        query_string: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            response_code: DEFAULT_RESPONSE_CODE,
            proto_num,
            method: method.into(),
            uri: uri.into(),
            query_string: query_string.into(),
            content_type: None,
            content_length: 0,
            cookie_data: None,
            authorization: None,
            headers: Vec::new(),
        }
    }

    /// Look up an ordinary header, ignoring ASCII case
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, value)| value.as_slice())
    }
}

/// How a request's script run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    /// Startup, execution and shutdown all succeeded
    Completed,
    /// The engine reported an error
    ScriptFailed,
    /// The engine bailed out abnormally
    Aborted,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::ScriptFailed => write!(f, "script_failed"),
            ExecutionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Result of one bridged request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOutcome {
    /// Correlation id of the request
    pub request_id: Uuid,
    /// Execution status
    pub status: ExecutionStatus,
    /// Final response code on the request record
    pub response_code: u16,
    /// First engine error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptError>,
    /// Wall time spent in the bridge in microseconds
    pub duration_us: u64,
}

impl RequestOutcome {
    /// Whether the script ran to completion
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Binding between the executing thread and one request
struct WorkerContext {
    worker_id: WorkerId,
    // Borrowed from `enter`'s caller; cleared before `enter` returns.
    variables: NonNull<[u8]>,
    host: Arc<dyn WorkerHost>,
    request: RefCell<RequestRecord>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Clears the thread's binding on scope exit, including unwinding.
struct Unbind;

impl Unbind {
    fn take(&self) -> Option<WorkerContext> {
        CURRENT.with(|current| current.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
    }
}

impl Drop for Unbind {
    fn drop(&mut self) {
        self.take();
    }
}

/// Bind a request to the calling thread for the duration of `f`.
///
/// Returns `f`'s result and the final request record. Fails with
/// [`BridgeError::ContextAlreadyBound`] if the thread already has a binding.
pub(crate) fn enter<R>(
    worker_id: WorkerId,
    variables: &[u8],
    host: Arc<dyn WorkerHost>,
    request: RequestRecord,
    f: impl FnOnce() -> R,
) -> Result<(R, RequestRecord)> {
    if let Ok(bound) = self::worker_id() {
        return Err(BridgeError::ContextAlreadyBound { worker_id: bound });
    }

    CURRENT.with(|current| {
        *current.borrow_mut() = Some(WorkerContext {
            worker_id,
            variables: NonNull::from(variables),
            host,
            request: RefCell::new(request),
        });
    });

    let unbind = Unbind;
    let out = f();
    let binding = unbind.take().ok_or(BridgeError::NoActiveWorkerContext)?;
    Ok((out, binding.request.into_inner()))
}

fn with_binding<R>(f: impl FnOnce(&WorkerContext) -> R) -> Result<R> {
    CURRENT.with(|current| {
        let slot = current
            .try_borrow()
            .map_err(|_| BridgeError::NoActiveWorkerContext)?;
        slot.as_ref().map(f).ok_or(BridgeError::NoActiveWorkerContext)
    })
}

/// Whether the calling thread is inside a bridged request
pub fn is_bound() -> bool {
    worker_id().is_ok()
}

/// Worker id bound to the calling thread
pub fn worker_id() -> Result<WorkerId> {
    with_binding(|ctx| ctx.worker_id)
}

/// Worker id and host sink bound to the calling thread
pub(crate) fn host() -> Result<(WorkerId, Arc<dyn WorkerHost>)> {
    with_binding(|ctx| (ctx.worker_id, Arc::clone(&ctx.host)))
}

/// Run `f` over the bound request's variable blob
pub fn with_variables<R>(f: impl FnOnce(&[u8]) -> R) -> Result<R> {
    with_binding(|ctx| {
        // SAFETY: `variables` was created from a live borrow in `enter`, and the
        // binding is removed before that borrow ends, so the pointer is valid
        // whenever a binding is visible.
        let blob = unsafe { ctx.variables.as_ref() };
        f(blob)
    })
}

/// Read the bound request record
pub fn with_request<R>(f: impl FnOnce(&RequestRecord) -> R) -> Result<R> {
    with_binding(|ctx| f(&ctx.request.borrow()))
}

/// Modify the bound request record, e.g. to set the response code.
///
/// Must not be nested inside another `with_request` or `with_request_mut`.
pub fn with_request_mut<R>(f: impl FnOnce(&mut RequestRecord) -> R) -> Result<R> {
    with_binding(|ctx| f(&mut ctx.request.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Severity, WorkerHost};

    struct NullHost;

    impl WorkerHost for NullHost {
        fn write_output(&self, _worker_id: WorkerId, bytes: &[u8]) -> usize {
            bytes.len()
        }
        fn send_header(&self, _worker_id: WorkerId, _header_line: &[u8]) {}
        fn log_message(&self, _worker_id: WorkerId, _message: &str, _severity: Severity) {}
        fn read_post(&self, _worker_id: WorkerId, _max_len: usize) -> Vec<u8> {
            Vec::new()
        }
    }

    fn record() -> RequestRecord {
        RequestRecord::new(1001, "GET", "/", "")
    }

    #[test]
    fn test_unbound_thread() {
        assert!(!is_bound());
        assert!(matches!(worker_id(), Err(BridgeError::NoActiveWorkerContext)));
        assert!(with_variables(|_| ()).is_err());
        assert!(with_request(|_| ()).is_err());
    }

    #[test]
    fn test_binding_visible_inside_enter() {
        let vars = b"blob".to_vec();
        let ((id, seen), _) = enter(7, &vars, Arc::new(NullHost), record(), || {
            let id = worker_id().unwrap();
            let seen = with_variables(|v| v.to_vec()).unwrap();
            (id, seen)
        })
        .unwrap();

        assert_eq!(id, 7);
        assert_eq!(seen, b"blob".to_vec());
        assert!(!is_bound());
    }

    #[test]
    fn test_request_mutation_is_returned() {
        let (seen, record) = enter(1, &[], Arc::new(NullHost), record(), || {
            with_request_mut(|r| r.response_code = 404).unwrap();
            with_request(|r| r.response_code).unwrap()
        })
        .unwrap();

        assert_eq!(seen, 404);
        assert_eq!(record.response_code, 404);
    }

    #[test]
    fn test_nested_enter_rejected() {
        let (nested, _) = enter(3, &[], Arc::new(NullHost), record(), || {
            enter(4, &[], Arc::new(NullHost), record(), || ())
        })
        .unwrap();

        match nested {
            Err(BridgeError::ContextAlreadyBound { worker_id }) => assert_eq!(worker_id, 3),
            other => panic!("expected ContextAlreadyBound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_binding_cleared_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _ = enter(9, &[], Arc::new(NullHost), record(), || panic!("bailout"));
        });

        assert!(result.is_err());
        assert!(!is_bound());
    }

    #[test]
    fn test_bindings_are_per_thread() {
        let (_, _) = enter(1, &[], Arc::new(NullHost), record(), || {
            let other = std::thread::spawn(is_bound).join().unwrap();
            assert!(!other);
        })
        .unwrap();
    }

    #[test]
    fn test_record_header_lookup() {
        let mut record = record();
        record.headers.push((b"X-Foo".to_vec(), b"bar".to_vec()));
        assert_eq!(record.header("x-foo"), Some(&b"bar"[..]));
        assert_eq!(record.header("x-bar"), None);
        assert_eq!(record.response_code, DEFAULT_RESPONSE_CODE);
    }
}
