//! C ABI for hosts that are not written in Rust.
//!
//! The host passes a [`HostVTable`] at init time and then calls
//! `phpkd_request` from its worker threads. Every buffer the host hands over
//! (the script path, and the method, URI, query and both blobs of each
//! request) moves into the bridge and must be allocated with
//! [`phpkd_buffer_alloc`]. The bridge frees each one exactly once on every
//! path; the script path is held until `phpkd_deinit`. Every pointer travels
//! with its length.
//!
//! The engine implementation itself is registered from Rust with
//! [`install_engine`] before `phpkd_init` is called.

use crate::config::{BridgeConfig, ConfigError};
use crate::context::{RequestDescriptor, WorkerId};
use crate::engine::bridge::panic_message;
use crate::engine::{EngineLifecycle, ScriptEngine};
use crate::error::{status_codes, BridgeError, Result};
use crate::host::{Severity, WorkerHost};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use tracing::{error, info};

/// Environment variable naming an optional JSON configuration file
pub const CONFIG_ENV: &str = "PHPKD_CONFIG";

/// Write response body bytes; returns the number accepted
pub type WriteOutputFn = unsafe extern "C" fn(worker_id: c_int, data: *const u8, len: usize) -> usize;
/// Send one header line
pub type SendHeaderFn = unsafe extern "C" fn(worker_id: c_int, data: *const u8, len: usize);
/// Emit one log line with a syslog severity
pub type LogMessageFn =
    unsafe extern "C" fn(worker_id: c_int, message: *const u8, len: usize, syslog_type: c_int);
/// Read up to `max_len` body bytes into a host-allocated buffer
pub type ReadPostFn =
    unsafe extern "C" fn(worker_id: c_int, max_len: usize, out_buf: *mut *mut u8, out_len: *mut usize);
/// Free a buffer returned by [`ReadPostFn`]
pub type ReleasePostFn = unsafe extern "C" fn(buf: *mut u8, len: usize);

/// Host callbacks, all keyed by worker id
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostVTable {
    /// Body writer
    pub write_output: WriteOutputFn,
    /// Header writer
    pub send_header: SendHeaderFn,
    /// Log sink
    pub log_message: LogMessageFn,
    /// Request body reader
    pub read_post: ReadPostFn,
    /// Releases request body chunks
    pub release_post: ReleasePostFn,
}

/// [`WorkerHost`] backed by a foreign vtable
struct ForeignHost {
    vtable: HostVTable,
}

impl WorkerHost for ForeignHost {
    fn write_output(&self, worker_id: WorkerId, bytes: &[u8]) -> usize {
        // SAFETY: the vtable contract requires the callback to only read `len` bytes.
        let written = unsafe { (self.vtable.write_output)(worker_id, bytes.as_ptr(), bytes.len()) };
        written.min(bytes.len())
    }

    fn send_header(&self, worker_id: WorkerId, header_line: &[u8]) {
        // SAFETY: as above.
        unsafe { (self.vtable.send_header)(worker_id, header_line.as_ptr(), header_line.len()) }
    }

    fn log_message(&self, worker_id: WorkerId, message: &str, severity: Severity) {
        // SAFETY: as above.
        unsafe {
            (self.vtable.log_message)(worker_id, message.as_ptr(), message.len(), severity as c_int)
        }
    }

    fn read_post(&self, worker_id: WorkerId, max_len: usize) -> Vec<u8> {
        let mut buf: *mut u8 = ptr::null_mut();
        let mut len: usize = 0;
        // SAFETY: both out-pointers are valid for writes for the call.
        unsafe { (self.vtable.read_post)(worker_id, max_len, &mut buf, &mut len) };
        if buf.is_null() {
            return Vec::new();
        }

        // SAFETY: the host returned `buf` with `len` readable bytes and keeps it
        // alive until `release_post`.
        let chunk = unsafe { std::slice::from_raw_parts(buf, len.min(max_len)) }.to_vec();
        // SAFETY: `buf` came from this host's `read_post` and is released once.
        unsafe { (self.vtable.release_post)(buf, len) };
        chunk
    }
}

/// A byte buffer allocated by [`phpkd_buffer_alloc`] and owned by the bridge
pub struct ForeignBuffer {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

impl ForeignBuffer {
    /// Take ownership of a buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by `phpkd_buffer_alloc(len)`
    /// and not freed since.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: NonNull::new(ptr),
            len,
        }
    }
}

impl AsRef<[u8]> for ForeignBuffer {
    fn as_ref(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: owned allocation of exactly `len` bytes.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl Drop for ForeignBuffer {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: ownership was transferred by `from_raw`.
            unsafe { free_buffer(ptr.as_ptr(), self.len) }
            #[cfg(test)]
            tests::FREED.with(|freed| freed.set(freed.get() + 1));
        }
    }
}

// SAFETY: the allocation is uniquely owned.
unsafe impl Send for ForeignBuffer {}

unsafe fn free_buffer(ptr: *mut u8, len: usize) {
    // SAFETY: caller guarantees `ptr` came from `phpkd_buffer_alloc(len)`.
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)) });
}

/// Allocate a zeroed buffer whose ownership can move into the bridge
#[no_mangle]
pub extern "C" fn phpkd_buffer_alloc(len: usize) -> *mut u8 {
    Box::into_raw(vec![0u8; len].into_boxed_slice()).cast::<u8>()
}

/// Free a buffer from [`phpkd_buffer_alloc`] that was never handed over
///
/// # Safety
///
/// `ptr` must be null or come from `phpkd_buffer_alloc(len)` and not have
/// been freed or passed to another `phpkd_*` entry point.
#[no_mangle]
pub unsafe extern "C" fn phpkd_buffer_free(ptr: *mut u8, len: usize) {
    if !ptr.is_null() {
        // SAFETY: forwarded caller contract.
        unsafe { free_buffer(ptr, len) }
    }
}

static ENGINE: Lazy<RwLock<Option<Arc<dyn ScriptEngine>>>> = Lazy::new(|| RwLock::new(None));
static LIFECYCLE: OnceCell<EngineLifecycle> = OnceCell::new();
// Script path handed over at init. Its lock also serializes `phpkd_init`.
static SCRIPT_PATH: Mutex<Option<ForeignBuffer>> = parking_lot::const_mutex(None);

/// Register the engine used by `phpkd_init`
pub fn install_engine(engine: Arc<dyn ScriptEngine>) -> Result<()> {
    if LIFECYCLE.get().is_some() {
        return Err(BridgeError::LifecycleMisuse(
            "engine installed after init".to_string(),
        ));
    }
    *ENGINE.write() = Some(engine);
    Ok(())
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` or `directive`.
///
/// Returns false if a global subscriber was already set.
pub fn init_tracing(directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .try_init()
        .is_ok()
}

/// Load the configuration for `script_path`.
///
/// If `PHPKD_CONFIG` names a JSON file, its settings are used and a
/// non-empty `script_path` overrides the file's.
pub fn load_config(script_path: &str) -> Result<BridgeConfig> {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::new(script_path),
    };
    if !script_path.is_empty() {
        config.script_path = script_path.into();
    }
    config.validate()?;
    Ok(config)
}

/// Run `f`, mapping errors and panics to a status code
fn status(entry: &str, f: impl FnOnce() -> Result<()>) -> c_int {
    let err = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return status_codes::SUCCESS,
        Ok(Err(err)) => err,
        Err(payload) => BridgeError::Internal(panic_message(&*payload)),
    };
    error!(entry, error = %err, code = %err.code(), "Bridge call failed");
    status_codes::FAILURE
}

/// Initialize the engine. Only valid once per process.
///
/// The lifecycle is only published once engine startup succeeds, so a
/// failed init can be retried with another engine or vtable.
///
/// # Safety
///
/// `script_path` must be null or come from `phpkd_buffer_alloc(script_path_len)`;
/// it is owned by the bridge afterwards, on failure too. `vtable` must be null
/// or point to a valid [`HostVTable`] whose callbacks stay callable until the
/// process exits.
#[no_mangle]
pub unsafe extern "C" fn phpkd_init(
    script_path: *mut u8,
    script_path_len: usize,
    vtable: *const HostVTable,
) -> c_int {
    // SAFETY: forwarded caller contract; ownership of the path moves here.
    let script_path = unsafe { ForeignBuffer::from_raw(script_path, script_path_len) };
    // SAFETY: forwarded caller contract.
    let vtable = unsafe { vtable.as_ref() }.copied();

    status("phpkd_init", || {
        let mut held = SCRIPT_PATH.lock();
        if LIFECYCLE.get().is_some() {
            return Err(BridgeError::LifecycleMisuse("init called twice".into()));
        }

        let path = std::str::from_utf8(script_path.as_ref()).map_err(|_| ConfigError::InvalidValue {
            field: "script_path".to_string(),
            reason: "not valid UTF-8".to_string(),
        })?;
        let config = load_config(path)?;
        init_tracing(&config.log_directive);

        let vtable = vtable.ok_or_else(|| BridgeError::LifecycleMisuse("missing host vtable".into()))?;
        let engine = ENGINE
            .read()
            .clone()
            .ok_or_else(|| BridgeError::LifecycleMisuse("no engine installed".into()))?;

        let lifecycle = EngineLifecycle::new(engine, Arc::new(ForeignHost { vtable }));
        lifecycle.startup(config)?;
        info!(script = %path, "phpkd initialized");

        if LIFECYCLE.set(lifecycle).is_err() {
            return Err(BridgeError::LifecycleMisuse("init raced another init".into()));
        }
        *held = Some(script_path);
        Ok(())
    })
}

/// Run one request on the calling thread.
///
/// All five buffers are consumed on every path, including failure.
///
/// # Safety
///
/// `method`, `uri`, `query`, `header_data` and `svar_data` must each be null
/// or come from `phpkd_buffer_alloc` with the given length, and must not be
/// used by the caller afterwards. A null or zero-length blob holds no records.
#[no_mangle]
pub unsafe extern "C" fn phpkd_request(
    worker_id: c_int,
    proto_num: c_int,
    method: *mut u8,
    method_len: usize,
    uri: *mut u8,
    uri_len: usize,
    query: *mut u8,
    query_len: usize,
    header_data: *mut u8,
    header_len: usize,
    svar_data: *mut u8,
    svar_len: usize,
) -> c_int {
    // SAFETY: forwarded caller contract; ownership of every buffer moves here.
    let descriptor = unsafe {
        RequestDescriptor::new(
            worker_id,
            proto_num,
            ForeignBuffer::from_raw(method, method_len),
            ForeignBuffer::from_raw(uri, uri_len),
            ForeignBuffer::from_raw(query, query_len),
            ForeignBuffer::from_raw(header_data, header_len),
            ForeignBuffer::from_raw(svar_data, svar_len),
        )
    };

    status("phpkd_request", || match LIFECYCLE.get() {
        Some(lifecycle) => lifecycle.run(descriptor).map(|_| ()),
        None => {
            drop(descriptor);
            Err(BridgeError::LifecycleMisuse("request before init".into()))
        }
    })
}

/// Tear the engine down and release the script path. Terminal: the process
/// is expected to exit.
#[no_mangle]
pub extern "C" fn phpkd_deinit() -> c_int {
    status("phpkd_deinit", || match LIFECYCLE.get() {
        Some(lifecycle) => {
            lifecycle.shutdown()?;
            drop(SCRIPT_PATH.lock().take());
            Ok(())
        }
        None => Err(BridgeError::LifecycleMisuse("deinit before init".into())),
    })
}
