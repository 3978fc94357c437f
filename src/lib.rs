//! # phpkd Bridge
//!
//! This library embeds a script engine with a SAPI-style, context-free
//! callback API inside a multi-worker host. It routes the engine's output,
//! header, log and input callbacks back to the host worker that owns the
//! request running on the calling thread.
//!
//! ## Architecture
//!
//! ```text
//! Host worker threads
//!     │
//!     │ phpkd_request / EngineLifecycle::run
//!     ▼
//! Rust Bridge (this crate)
//!     │  decode blobs, bind worker context
//!     │
//!     │ request startup / execute / shutdown
//!     ▼
//! Script engine ──callbacks──► Bridge ──worker id──► Host sink
//! ```
//!
//! ## Features
//!
//! - **Worker Routing**: Every engine callback reaches the worker that owns the request
//! - **Bounds-Checked Blobs**: Header and variable blobs are validated before use
//! - **Fail-Safe Cleanup**: Engine errors and bailouts never leak request inputs
//! - **Single Lifecycle**: Init and deinit are enforced once per process
//! - **C ABI**: Usable from hosts written in any language

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod host;
pub mod host_functions;
pub mod metrics;

// Re-export commonly used types
pub use codec::BlobBuilder;
pub use config::BridgeConfig;
pub use context::{ExecutionStatus, RequestDescriptor, RequestOutcome, RequestRecord, WorkerId};
pub use engine::{EngineLifecycle, LifecycleState, RequestBridge, ScriptEngine, StartupOptions};
pub use error::{BridgeError, ErrorCode, ScriptError};
pub use host::{HostRequest, Severity, WorkerHost, WorkerTable};
pub use host_functions::{CallbackTable, CALLBACKS};
pub use metrics::{BridgeMetrics, BridgeStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_server_software_tracks_version() {
        assert_eq!(config::DEFAULT_SERVER_SOFTWARE, format!("phpkd/{}", VERSION));
    }
}
