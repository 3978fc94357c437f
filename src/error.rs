//! Error types for the bridge.
//!
//! This module defines error codes, script error details, and the main error
//! type used throughout the bridge.

use crate::context::WorkerId;
use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A key/value blob's declared lengths do not match its size
    MalformedBlob,
    /// A sink operation ran without a bound worker context
    NoActiveWorkerContext,
    /// A worker context was bound while another one was active
    ContextAlreadyBound,
    /// Lifecycle entry points called out of order
    LifecycleMisuse,
    /// The script failed (syntax error, uncaught exception, fatal error)
    ScriptExecution,
    /// The engine failed to start a request
    RequestStartup,
    /// The engine aborted execution abnormally
    EngineAbort,
    /// Invalid configuration
    InvalidConfig,
    /// Internal bridge error (bug)
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::MalformedBlob => write!(f, "MALFORMED_BLOB"),
            ErrorCode::NoActiveWorkerContext => write!(f, "NO_ACTIVE_WORKER_CONTEXT"),
            ErrorCode::ContextAlreadyBound => write!(f, "CONTEXT_ALREADY_BOUND"),
            ErrorCode::LifecycleMisuse => write!(f, "LIFECYCLE_MISUSE"),
            ErrorCode::ScriptExecution => write!(f, "SCRIPT_EXECUTION"),
            ErrorCode::RequestStartup => write!(f, "REQUEST_STARTUP"),
            ErrorCode::EngineAbort => write!(f, "ENGINE_ABORT"),
            ErrorCode::InvalidConfig => write!(f, "INVALID_CONFIG"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// Error details reported by the embedded engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Script file the error was raised in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Line number (1-indexed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    /// Create an execution error
    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ScriptExecution, message)
    }

    /// Create a request startup error
    pub fn startup_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RequestStartup, message)
    }

    /// Create an abort error from an intercepted engine bailout
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EngineAbort, message)
    }

    /// Add source location
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " in {} on line {}", file, line)?,
            (Some(file), None) => write!(f, " in {}", file)?,
            _ => {}
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Key/value blob failed bounds validation
    #[error("Malformed key/value blob at byte {offset}: {reason}")]
    MalformedBlob {
        /// Byte offset where decoding failed
        offset: usize,
        /// What was wrong
        reason: String,
    },

    /// Sink operation invoked outside a bound request
    #[error("No active worker context on this thread")]
    NoActiveWorkerContext,

    /// Nested binding attempt
    #[error("Worker context already bound on this thread (worker {worker_id})")]
    ContextAlreadyBound {
        /// The worker id that is currently bound
        worker_id: WorkerId,
    },

    /// Lifecycle entry point called in the wrong state
    #[error("Lifecycle misuse: {0}")]
    LifecycleMisuse(String),

    /// Engine-reported failure
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Unexpected failure inside the bridge, such as a panic caught at the C boundary
    #[error("Internal bridge error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create a malformed blob error
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        BridgeError::MalformedBlob {
            offset,
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::MalformedBlob { .. } => ErrorCode::MalformedBlob,
            BridgeError::NoActiveWorkerContext => ErrorCode::NoActiveWorkerContext,
            BridgeError::ContextAlreadyBound { .. } => ErrorCode::ContextAlreadyBound,
            BridgeError::LifecycleMisuse(_) => ErrorCode::LifecycleMisuse,
            BridgeError::Script(e) => e.code,
            BridgeError::Config(_) => ErrorCode::InvalidConfig,
            BridgeError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Status codes returned across the C ABI
pub mod status_codes {
    /// Success
    pub const SUCCESS: i32 = 0;
    /// Failure
    pub const FAILURE: i32 = -1;
}
