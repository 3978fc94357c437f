//! Bridge configuration types and defaults.
//!
//! This module defines the configuration handed to the engine lifecycle at
//! startup: the script every request executes, the engine's static
//! configuration buffer, and logging defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default tracing filter directive
pub const DEFAULT_LOG_DIRECTIVE: &str = "phpkd_bridge=info";

/// Default `SERVER_SOFTWARE` value exposed to scripts
pub const DEFAULT_SERVER_SOFTWARE: &str = concat!("phpkd/", env!("CARGO_PKG_VERSION"));

/// Configuration for the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Script executed for every request
    pub script_path: PathBuf,

    /// Engine ini entries, copied into the static configuration buffer
    #[serde(default)]
    pub ini_entries: String,

    /// Keep the engine from changing into the script's directory (default: true)
    #[serde(default = "default_true")]
    pub no_chdir: bool,

    /// Value of `SERVER_SOFTWARE`
    #[serde(default = "default_server_software")]
    pub server_software: String,

    /// Tracing filter directive used when the bridge installs a subscriber
    #[serde(default = "default_log_directive")]
    pub log_directive: String,
}

impl BridgeConfig {
    /// Create a new configuration for the given script
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            ini_entries: String::new(),
            no_chdir: true,
            server_software: default_server_software(),
            log_directive: default_log_directive(),
        }
    }

    /// Set the ini entries
    pub fn with_ini_entries(mut self, entries: impl Into<String>) -> Self {
        self.ini_entries = entries.into();
        self
    }

    /// Allow or forbid chdir into the script directory
    pub fn with_no_chdir(mut self, no_chdir: bool) -> Self {
        self.no_chdir = no_chdir;
        self
    }

    /// Set the server software string
    pub fn with_server_software(mut self, software: impl Into<String>) -> Self {
        self.server_software = software.into();
        self
    }

    /// Set the log directive
    pub fn with_log_directive(mut self, directive: impl Into<String>) -> Self {
        self.log_directive = directive.into();
        self
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.script_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "script_path".into(),
            });
        }

        if self.ini_entries.contains('\0') {
            return Err(ConfigError::InvalidValue {
                field: "ini_entries".into(),
                reason: "must not contain NUL bytes".into(),
            });
        }

        if self.server_software.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "server_software".into(),
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_server_software() -> String {
    DEFAULT_SERVER_SOFTWARE.to_string()
}

fn default_log_directive() -> String {
    DEFAULT_LOG_DIRECTIVE.to_string()
}
