//! Integration tests for phpkd-bridge.
//!
//! These tests drive the bridge the way a host does:
//! - Lifecycle startup and shutdown
//! - Concurrent requests on separate worker threads
//! - Callback routing through the registered callback table
//! - Response capture and access logging in the worker table

use std::path::Path;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use parking_lot::Mutex;
use phpkd_bridge::context;
use phpkd_bridge::host::common_log_line;
use phpkd_bridge::{
    BridgeConfig, BridgeError, CallbackTable, EngineLifecycle, ErrorCode, ExecutionStatus, HostRequest,
    LifecycleState, ScriptEngine, ScriptError, StartupOptions, WorkerHost, WorkerTable,
};

/// Engine double that echoes `REQUEST_URI` back through the callbacks
#[derive(Default)]
struct EchoEngine {
    callbacks: Mutex<Option<&'static CallbackTable>>,
}

impl EchoEngine {
    fn callbacks(&self) -> &'static CallbackTable {
        self.callbacks.lock().expect("module_startup not called")
    }
}

impl ScriptEngine for EchoEngine {
    fn module_startup(
        &self,
        callbacks: &'static CallbackTable,
        _options: StartupOptions<'_>,
    ) -> Result<(), ScriptError> {
        *self.callbacks.lock() = Some(callbacks);
        Ok(())
    }

    fn request_startup(&self) -> Result<(), ScriptError> {
        Ok(())
    }

    fn execute_script(&self, _path: &Path) -> Result<(), ScriptError> {
        let callbacks = self.callbacks();

        let mut uri = Vec::new();
        (callbacks.register_variables)(&mut |key, value| {
            if key == b"REQUEST_URI" {
                uri = value.to_vec();
            }
        });

        let path = uri.split(|b| *b == b'?').next().unwrap_or_default();

        if path.ends_with(b"/missing") {
            (callbacks.send_header)(Some(&b"HTTP/1.1 404 Not Found"[..]));
            context::with_request_mut(|r| r.response_code = 404).ok();
        }
        (callbacks.send_header)(Some(&b"Content-Type: text/plain"[..]));

        // Yield between writes so concurrent workers interleave.
        for chunk in uri.chunks(3) {
            (callbacks.ub_write)(chunk);
            thread::yield_now();
        }

        if path.ends_with(b"/fatal") {
            panic!("Maximum execution time exceeded");
        }
        Ok(())
    }

    fn request_shutdown(&self) {}
}

fn started(workers: usize) -> (Arc<EngineLifecycle>, Arc<WorkerTable>, BridgeConfig) {
    let table = Arc::new(WorkerTable::with_workers(workers));
    let host: Arc<dyn WorkerHost> = table.clone();
    let lifecycle = Arc::new(EngineLifecycle::new(Arc::new(EchoEngine::default()), host));
    let config = BridgeConfig::new("/srv/index.php");
    lifecycle.startup(config.clone()).unwrap();
    (lifecycle, table, config)
}

// ============================================================================
// Test: Context Isolation
// ============================================================================

#[test]
fn test_concurrent_workers_are_isolated() {
    let (lifecycle, table, config) = started(2);

    let handles: Vec<_> = (0..2)
        .map(|worker_id| {
            let lifecycle = Arc::clone(&lifecycle);
            let table = Arc::clone(&table);
            let config = config.clone();
            thread::spawn(move || {
                for n in 0..50 {
                    let uri = format!("/worker-{}/request-{}", worker_id, n);
                    table.begin_request(worker_id, Vec::new());

                    let descriptor = HostRequest::new("GET", uri.clone()).into_descriptor(worker_id, &config);
                    let outcome = lifecycle.run(descriptor).unwrap();
                    assert_eq!(outcome.status, ExecutionStatus::Completed);

                    let capture = table.finish_request(worker_id).unwrap();
                    assert_eq!(String::from_utf8(capture.body).unwrap(), uri);
                    assert!(!context::is_bound());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = lifecycle.metrics().snapshot();
    assert_eq!(stats.requests_started, 100);
    assert_eq!(stats.requests_completed, 100);
}

// ============================================================================
// Test: Full Request Cycle
// ============================================================================

#[test]
fn test_request_cycle_with_access_log() {
    let (lifecycle, table, config) = started(1);

    let request = HostRequest::new("GET", "/app/missing?x=1")
        .with_remote_addr("127.0.0.1:50000")
        .with_header("Host", "localhost");
    table.begin_request(0, Vec::new());

    let outcome = lifecycle
        .run(request.clone().into_descriptor(0, &config))
        .unwrap();
    let capture = table.finish_request(0).unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.response_code, 404);
    assert_eq!(capture.status_code(), 404);
    assert_eq!(capture.header("Content-Type"), Some("text/plain"));
    assert_eq!(capture.body, b"/app/missing?x=1".to_vec());

    let line = common_log_line(&request, &capture, &Utc::now());
    assert!(line.starts_with("127.0.0.1:50000 - - ["));
    assert!(line.ends_with("\"GET /app/missing?x=1 HTTP/1.1\" 404 16"));
}

#[test]
fn test_bailout_keeps_worker_usable() {
    let (lifecycle, table, config) = started(1);

    table.begin_request(0, Vec::new());
    let outcome = lifecycle
        .run(HostRequest::new("GET", "/fatal").into_descriptor(0, &config))
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Aborted);
    let capture = table.finish_request(0).unwrap();
    assert!(capture.error_log.iter().any(|entry| entry.message.contains("Maximum execution time")));
    assert!(!context::is_bound());

    table.begin_request(0, Vec::new());
    let outcome = lifecycle
        .run(HostRequest::new("GET", "/next").into_descriptor(0, &config))
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(table.finish_request(0).unwrap().body, b"/next".to_vec());
}

// ============================================================================
// Test: Lifecycle Misuse
// ============================================================================

#[test]
fn test_lifecycle_misuse() {
    let (lifecycle, _table, config) = started(1);

    let err = lifecycle.startup(config.clone()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::LifecycleMisuse);

    lifecycle.shutdown().unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::ShutDown);

    let err = lifecycle
        .run(HostRequest::new("GET", "/").into_descriptor(0, &config))
        .unwrap_err();
    assert!(matches!(err, BridgeError::LifecycleMisuse(_)));
    assert!(lifecycle.shutdown().is_err());
}
