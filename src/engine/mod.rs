//! Script engine management.
//!
//! This module provides the [`EngineLifecycle`] that initializes the
//! embedded engine once, runs requests through the [`RequestBridge`] from any
//! number of worker threads, and tears the engine down once.

pub mod bridge;

use crate::config::BridgeConfig;
use crate::context::{RequestDescriptor, RequestOutcome};
use crate::error::{BridgeError, ErrorCode, Result, ScriptError};
use crate::host::WorkerHost;
use crate::host_functions::{CallbackTable, CALLBACKS};
use crate::metrics::BridgeMetrics;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument};

pub use bridge::RequestBridge;

/// Options passed to the engine at module startup
#[derive(Debug, Clone, Copy)]
pub struct StartupOptions<'a> {
    /// Static ini configuration buffer
    pub ini_entries: &'a str,
    /// Do not chdir into the script's directory
    pub no_chdir: bool,
}

/// The embedded engine's global API.
///
/// Implementations wrap an engine whose request state is per thread. The
/// bridge guarantees that every request method is called on the thread that
/// runs the request, with that request's worker context bound.
///
/// An engine bailout should be raised as a panic; the bridge catches it.
pub trait ScriptEngine: Send + Sync {
    /// Initialize the engine and register the callback table
    fn module_startup(
        &self,
        callbacks: &'static CallbackTable,
        options: StartupOptions<'_>,
    ) -> std::result::Result<(), ScriptError>;

    /// Register the calling thread with the engine. Must be idempotent.
    fn attach_thread(&self) {}

    /// Start a request on the calling thread
    fn request_startup(&self) -> std::result::Result<(), ScriptError>;

    /// Execute the script for the current request
    fn execute_script(&self, path: &Path) -> std::result::Result<(), ScriptError>;

    /// Finish the current request
    fn request_shutdown(&self);

    /// Process an `Authorization` header value before the request starts
    fn handle_auth_data(&self, request: &mut crate::context::RequestRecord, value: &[u8]) {
        request.authorization = Some(value.to_vec());
    }

    /// Tear the engine down
    fn shutdown(&self) {}
}

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    /// `startup` has not been called
    Uninitialized,
    /// Accepting requests
    Running,
    /// Torn down; terminal
    ShutDown,
}

struct Running {
    config: BridgeConfig,
    // Owned copy of the engine's static configuration buffer.
    ini_entries: Box<str>,
    bridge: RequestBridge,
}

enum Phase {
    Uninitialized,
    Running(Running),
    ShutDown,
}

/// Process-wide engine lifecycle.
///
/// Out-of-order calls (a second `startup`, `run` before `startup` or after
/// `shutdown`, a repeated `shutdown`) are logged at error level and returned
/// as [`BridgeError::LifecycleMisuse`] in every build profile. They never
/// abort the process, debug builds included, so a host can recover and a
/// test can assert on them.
pub struct EngineLifecycle {
    engine: Arc<dyn ScriptEngine>,
    host: Arc<dyn WorkerHost>,
    phase: RwLock<Phase>,
    metrics: Arc<BridgeMetrics>,
}

impl EngineLifecycle {
    /// Create a lifecycle in the uninitialized state
    pub fn new(engine: Arc<dyn ScriptEngine>, host: Arc<dyn WorkerHost>) -> Self {
        Self {
            engine,
            host,
            phase: RwLock::new(Phase::Uninitialized),
            metrics: Arc::new(BridgeMetrics::new()),
        }
    }

    /// Initialize the engine. Only valid once.
    #[instrument(skip(self, config), fields(script = %config.script_path.display()))]
    pub fn startup(&self, config: BridgeConfig) -> Result<()> {
        let mut phase = self.phase.write();
        match *phase {
            Phase::Uninitialized => {}
            Phase::Running(_) => return Err(misuse("startup called while running")),
            Phase::ShutDown => return Err(misuse("startup called after shutdown")),
        }

        config.validate()?;
        let ini_entries: Box<str> = config.ini_entries.as_str().into();

        self.engine.module_startup(
            &CALLBACKS,
            StartupOptions {
                ini_entries: &ini_entries,
                no_chdir: config.no_chdir,
            },
        )?;

        let bridge = RequestBridge::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.host),
            config.script_path.clone(),
            Arc::clone(&self.metrics),
        );

        info!(no_chdir = config.no_chdir, "Engine started");
        *phase = Phase::Running(Running {
            config,
            ini_entries,
            bridge,
        });
        Ok(())
    }

    /// Run one request on the calling thread.
    ///
    /// The descriptor is consumed and released even when the request is
    /// rejected.
    pub fn run<B: AsRef<[u8]>>(&self, descriptor: RequestDescriptor<B>) -> Result<RequestOutcome> {
        let phase = self.phase.read();
        match &*phase {
            Phase::Running(running) => running.bridge.run(descriptor),
            _ => {
                drop(descriptor);
                self.metrics.record_rejected(ErrorCode::LifecycleMisuse);
                Err(misuse("request received while the engine is not running"))
            }
        }
    }

    /// Tear the engine down. Waits for in-flight requests; only valid once.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<()> {
        let mut phase = self.phase.write();
        match std::mem::replace(&mut *phase, Phase::ShutDown) {
            Phase::Running(running) => {
                self.engine.shutdown();
                info!(script = %running.config.script_path.display(), "Engine shut down");
                Ok(())
            }
            Phase::Uninitialized => {
                *phase = Phase::Uninitialized;
                Err(misuse("shutdown called before startup"))
            }
            Phase::ShutDown => Err(misuse("shutdown called twice")),
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        match *self.phase.read() {
            Phase::Uninitialized => LifecycleState::Uninitialized,
            Phase::Running(_) => LifecycleState::Running,
            Phase::ShutDown => LifecycleState::ShutDown,
        }
    }

    /// Active configuration while running
    pub fn config(&self) -> Option<BridgeConfig> {
        match &*self.phase.read() {
            Phase::Running(running) => Some(running.config.clone()),
            _ => None,
        }
    }

    /// Engine configuration buffer while running
    pub fn ini_entries(&self) -> Option<String> {
        match &*self.phase.read() {
            Phase::Running(running) => Some(running.ini_entries.to_string()),
            _ => None,
        }
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }
}

fn misuse(message: &str) -> BridgeError {
    error!(reason = message, "Lifecycle misuse");
    BridgeError::LifecycleMisuse(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::context::{self, RequestRecord, WorkerId};
    use crate::host::WorkerTable;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        events: Mutex<Vec<String>>,
        seen: Mutex<Option<RequestRecord>>,
        fail_startup: bool,
    }

    impl ScriptEngine for RecordingEngine {
        fn module_startup(
            &self,
            callbacks: &'static CallbackTable,
            options: StartupOptions<'_>,
        ) -> std::result::Result<(), ScriptError> {
            if self.fail_startup {
                return Err(ScriptError::startup_failed("no memory"));
            }
            self.events.lock().push(format!(
                "startup:{}:{}:{}",
                callbacks.name, options.ini_entries, options.no_chdir
            ));
            Ok(())
        }

        fn request_startup(&self) -> std::result::Result<(), ScriptError> {
            Ok(())
        }

        fn execute_script(&self, path: &Path) -> std::result::Result<(), ScriptError> {
            self.events.lock().push(format!("execute:{}", path.display()));
            *self.seen.lock() = context::with_request(|r| r.clone()).ok();
            Ok(())
        }

        fn request_shutdown(&self) {}

        fn shutdown(&self) {
            self.events.lock().push("shutdown".to_string());
        }
    }

    fn lifecycle(engine: Arc<RecordingEngine>) -> EngineLifecycle {
        EngineLifecycle::new(engine, Arc::new(WorkerTable::with_workers(1)))
    }

    fn descriptor(worker_id: WorkerId) -> RequestDescriptor {
        RequestDescriptor::new(worker_id, 1001, "GET", "/", "", Vec::new(), codec::BlobBuilder::new().finish())
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let engine = Arc::new(RecordingEngine::default());
        let lifecycle = lifecycle(engine.clone());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        lifecycle
            .startup(BridgeConfig::new("/srv/index.php").with_ini_entries("a=1"))
            .unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        assert_eq!(lifecycle.ini_entries().as_deref(), Some("a=1"));

        let outcome = lifecycle.run(descriptor(0)).unwrap();
        assert!(outcome.is_success());

        lifecycle.shutdown().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::ShutDown);
        assert!(lifecycle.config().is_none());

        let events = engine.events.lock().clone();
        assert_eq!(
            events,
            vec![
                "startup:phpkd:a=1:true".to_string(),
                "execute:/srv/index.php".to_string(),
                "shutdown".to_string(),
            ]
        );
    }

    #[test]
    fn test_header_classification_through_run() {
        let engine = Arc::new(RecordingEngine::default());
        let lifecycle = lifecycle(engine.clone());
        lifecycle.startup(BridgeConfig::new("/srv/index.php")).unwrap();

        let header_blob = codec::encode([("Content-Type", "text/html"), ("X-Foo", "bar"), ("COOKIE", "a=1")]);
        let descriptor = RequestDescriptor::new(0, 1001, "GET", "/", "", header_blob, Vec::new());
        assert!(lifecycle.run(descriptor).unwrap().is_success());

        let seen = engine.seen.lock().clone().unwrap();
        assert_eq!(seen.content_type, Some(b"text/html".to_vec()));
        assert_eq!(seen.cookie_data, Some(b"a=1".to_vec()));
        assert_eq!(seen.headers, vec![(b"X-Foo".to_vec(), b"bar".to_vec())]);
        assert_eq!(seen.header("x-foo"), Some(&b"bar"[..]));
    }

    #[test]
    fn test_double_startup_rejected() {
        let engine = Arc::new(RecordingEngine::default());
        let lifecycle = lifecycle(engine.clone());
        lifecycle.startup(BridgeConfig::new("index.php")).unwrap();

        let err = lifecycle.startup(BridgeConfig::new("other.php")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LifecycleMisuse);
        assert_eq!(engine.events.lock().len(), 1);
        assert_eq!(
            lifecycle.config().unwrap().script_path,
            std::path::PathBuf::from("index.php")
        );
    }

    #[test]
    fn test_run_before_startup_rejected() {
        let lifecycle = lifecycle(Arc::new(RecordingEngine::default()));
        let err = lifecycle.run(descriptor(0)).unwrap_err();
        assert!(matches!(err, BridgeError::LifecycleMisuse(_)));
        assert_eq!(lifecycle.metrics().snapshot().rejected, 1);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let lifecycle = lifecycle(Arc::new(RecordingEngine::default()));
        assert!(lifecycle.shutdown().is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        lifecycle.startup(BridgeConfig::new("index.php")).unwrap();
        lifecycle.shutdown().unwrap();

        assert!(lifecycle.shutdown().is_err());
        assert!(lifecycle.startup(BridgeConfig::new("index.php")).is_err());
        assert!(lifecycle.run(descriptor(0)).is_err());
        assert_eq!(lifecycle.state(), LifecycleState::ShutDown);
    }

    #[test]
    fn test_failed_startup_stays_uninitialized() {
        let engine = Arc::new(RecordingEngine {
            fail_startup: true,
            ..RecordingEngine::default()
        });
        let lifecycle = lifecycle(engine);

        let err = lifecycle.startup(BridgeConfig::new("index.php")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RequestStartup);
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let lifecycle = lifecycle(Arc::new(RecordingEngine::default()));
        let err = lifecycle.startup(BridgeConfig::new("")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }
}
