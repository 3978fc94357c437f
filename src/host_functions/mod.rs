//! Callbacks exposed to the embedded engine.
//!
//! The engine calls these without any context argument. Each operation
//! resolves the calling thread's worker context and forwards to the bound
//! host sink with that worker's id.
//!
//! The functions in the submodules return [`BridgeError::NoActiveWorkerContext`](crate::error::BridgeError::NoActiveWorkerContext)
//! when called outside a request. The [`CALLBACKS`] table registered with the
//! engine wraps them and treats that error as fatal.

pub mod input;
pub mod logging;
pub mod output;

use crate::error::Result;
use crate::host::Severity;

/// SAPI name reported to the engine
pub const SAPI_NAME: &str = "phpkd";

/// Callback table handed to [`ScriptEngine::module_startup`](crate::engine::ScriptEngine::module_startup)
#[derive(Clone, Copy)]
pub struct CallbackTable {
    /// SAPI name
    pub name: &'static str,
    /// Human-readable SAPI name
    pub pretty_name: &'static str,
    /// Unbuffered body write; returns the number of bytes accepted
    pub ub_write: fn(&[u8]) -> usize,
    /// Forward one header line; `None` is a no-op
    pub send_header: fn(Option<&[u8]>),
    /// Log a line with a syslog severity
    pub log_message: fn(&str, i32),
    /// Engine error hook: error type and formatted message
    pub sapi_error: fn(i32, &str),
    /// Read request body into the buffer; returns bytes copied
    pub read_post: fn(&mut [u8]) -> usize,
    /// Raw cookie header of the current request
    pub read_cookies: fn() -> Option<Vec<u8>>,
    /// Feed every server variable to the engine's registrar
    pub register_variables: fn(&mut dyn FnMut(&[u8], &[u8])) -> usize,
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("name", &self.name)
            .field("pretty_name", &self.pretty_name)
            .finish_non_exhaustive()
    }
}

/// The bridge's callback table
pub static CALLBACKS: CallbackTable = CallbackTable {
    name: SAPI_NAME,
    pretty_name: SAPI_NAME,
    ub_write,
    send_header,
    log_message,
    sapi_error,
    read_post,
    read_cookies,
    register_variables,
};

fn fatal<T>(callback: &str, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(callback, error = %err, "Engine callback failed");
            panic!("{} callback failed: {}", callback, err)
        }
    }
}

fn ub_write(bytes: &[u8]) -> usize {
    fatal("ub_write", output::write_body(bytes))
}

fn send_header(line: Option<&[u8]>) {
    fatal("send_header", output::send_header(line))
}

fn log_message(message: &str, syslog_type: i32) {
    fatal("log_message", logging::log_message(message, Severity::from(syslog_type)))
}

fn sapi_error(error_type: i32, message: &str) {
    fatal("sapi_error", logging::report_error(error_type, message))
}

fn read_post(dest: &mut [u8]) -> usize {
    fatal("read_post", input::read_post(dest))
}

fn read_cookies() -> Option<Vec<u8>> {
    fatal("read_cookies", input::read_cookies())
}

fn register_variables(registrar: &mut dyn FnMut(&[u8], &[u8])) -> usize {
    fatal("register_variables", input::register_variables(registrar))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    fn is_unbound<T>(result: Result<T>) -> bool {
        matches!(result, Err(BridgeError::NoActiveWorkerContext))
    }

    #[test]
    fn test_callback_table_names() {
        assert_eq!(CALLBACKS.name, "phpkd");
        assert_eq!(CALLBACKS.pretty_name, SAPI_NAME);
    }

    #[test]
    fn test_unbound_callback_is_fatal() {
        let result = std::panic::catch_unwind(|| (CALLBACKS.ub_write)(b"x"));
        assert!(result.is_err());

        let result = std::panic::catch_unwind(|| (CALLBACKS.read_cookies)());
        assert!(result.is_err());
    }

    #[test]
    fn test_unbound_sink_returns_error() {
        assert!(is_unbound(output::write_body(b"x")));
        assert!(is_unbound(output::send_header(None)));
        assert!(is_unbound(logging::log_message("x", Severity::Info)));
        assert!(is_unbound(input::read_post(&mut [0u8; 4])));
        assert!(is_unbound(input::read_cookies()));
        assert!(is_unbound(input::register_variables(&mut |_, _| {})));
    }
}
