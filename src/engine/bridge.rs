//! Per-request bridge between a host worker and the engine.
//!
//! [`RequestBridge::run`] takes ownership of a request descriptor, prepares
//! the engine's request record from the header blob, binds the worker
//! context and drives the engine through startup, execution and shutdown.
//! Engine errors and bailouts never escape: they are logged through the
//! worker's sink and reported in the [`RequestOutcome`].

use super::ScriptEngine;
use crate::codec;
use crate::context::{self, ExecutionStatus, RequestDescriptor, RequestOutcome, RequestRecord};
use crate::error::{ErrorCode, Result, ScriptError};
use crate::host::{Severity, WorkerHost};
use crate::host_functions::logging;
use crate::metrics::{BridgeMetrics, RequestTimer};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info_span, warn};

/// Result of the guarded engine steps
struct Execution {
    status: ExecutionStatus,
    error: Option<ScriptError>,
}

/// Runs requests against a started engine
pub struct RequestBridge {
    engine: Arc<dyn ScriptEngine>,
    host: Arc<dyn WorkerHost>,
    script_path: PathBuf,
    metrics: Arc<BridgeMetrics>,
}

impl RequestBridge {
    pub(crate) fn new(
        engine: Arc<dyn ScriptEngine>,
        host: Arc<dyn WorkerHost>,
        script_path: PathBuf,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            engine,
            host,
            script_path,
            metrics,
        }
    }

    /// Script executed for every request
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Run one request on the calling thread.
    ///
    /// Script failures and engine aborts are returned as `Ok` with a
    /// non-completed status. Only malformed blobs and a context already
    /// bound on this thread are errors. Every part of `descriptor` is
    /// dropped exactly once before this returns or unwinds.
    pub fn run<B: AsRef<[u8]>>(&self, descriptor: RequestDescriptor<B>) -> Result<RequestOutcome> {
        let timer = RequestTimer::start();
        self.metrics.record_started();

        let RequestDescriptor {
            worker_id,
            proto_num,
            method,
            uri,
            query,
            header_blob,
            variable_blob,
        } = descriptor;

        self.engine.attach_thread();

        let mut record = RequestRecord::new(proto_num, method.as_ref(), uri.as_ref(), query.as_ref());
        drop((method, uri, query));
        let prepared = codec::validate(variable_blob.as_ref())
            .and_then(|_| self.classify_headers(header_blob.as_ref(), &mut record));
        if let Err(err) = prepared {
            warn!(worker_id, error = %err, "Rejecting request");
            self.metrics.record_rejected(err.code());
            return Err(err);
        }
        drop(header_blob);

        let span = info_span!(
            "request",
            worker_id,
            request_id = %record.request_id,
            method = %String::from_utf8_lossy(&record.method),
            uri = %String::from_utf8_lossy(&record.uri)
        );
        let _entered = span.enter();

        let bound = context::enter(
            worker_id,
            variable_blob.as_ref(),
            Arc::clone(&self.host),
            record,
            || self.execute(),
        );
        let (execution, record) = match bound {
            Ok(done) => done,
            Err(err) => {
                warn!(error = %err, "Rejecting request");
                self.metrics.record_rejected(err.code());
                return Err(err);
            }
        };

        let outcome = RequestOutcome {
            request_id: record.request_id,
            status: execution.status,
            response_code: record.response_code,
            error: execution.error,
            duration_us: timer.elapsed_us(),
        };
        self.metrics.record(&outcome);
        debug!(
            status = %outcome.status,
            response_code = outcome.response_code,
            duration_us = outcome.duration_us,
            "Request finished"
        );
        Ok(outcome)
    }

    /// Copy the special headers onto the record and keep the rest in order
    fn classify_headers(&self, blob: &[u8], record: &mut RequestRecord) -> Result<usize> {
        codec::decode(blob, |key, value| {
            if key.eq_ignore_ascii_case(b"content-type") {
                record.content_type = Some(value.to_vec());
            } else if key.eq_ignore_ascii_case(b"content-length") {
                record.content_length = parse_content_length(value);
            } else if key.eq_ignore_ascii_case(b"cookie") {
                record.cookie_data = Some(value.to_vec());
            } else if key.eq_ignore_ascii_case(b"authorization") {
                self.engine.handle_auth_data(record, value);
            } else {
                record.headers.push((key.to_vec(), value.to_vec()));
            }
        })
    }

    /// Startup, execute and shutdown with the worker context bound
    fn execute(&self) -> Execution {
        if let Err(error) = guarded(|| self.engine.request_startup()) {
            return self.failed(error);
        }

        let executed = guarded(|| self.engine.execute_script(&self.script_path));
        let shut_down = guarded(|| {
            self.engine.request_shutdown();
            Ok(())
        });

        match (executed, shut_down) {
            (Ok(()), Ok(())) => Execution {
                status: ExecutionStatus::Completed,
                error: None,
            },
            (Err(error), Ok(())) | (Ok(()), Err(error)) => self.failed(error),
            (Err(error), Err(late)) => {
                self.report(&late);
                self.failed(error)
            }
        }
    }

    fn failed(&self, error: ScriptError) -> Execution {
        self.report(&error);
        let status = match error.code {
            ErrorCode::EngineAbort => ExecutionStatus::Aborted,
            _ => ExecutionStatus::ScriptFailed,
        };
        Execution {
            status,
            error: Some(error),
        }
    }

    fn report(&self, error: &ScriptError) {
        if let Err(err) = logging::log_message(&error.to_string(), Severity::Error) {
            warn!(error = %err, "Could not report engine error");
        }
    }
}

/// Run one engine step, turning a bailout into an abort error
fn guarded(step: impl FnOnce() -> std::result::Result<(), ScriptError>) -> std::result::Result<(), ScriptError> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(payload) => Err(ScriptError::aborted(panic_message(&*payload))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "engine bailout".to_string()
    }
}

/// Parse a `Content-Length` value the way C `strtol` does.
///
/// Leading whitespace and a sign are accepted, the longest digit prefix is
/// used, overflow saturates, and no digits at all yields 0.
pub(crate) fn parse_content_length(value: &[u8]) -> i64 {
    let start = value
        .iter()
        .position(|c| !(c.is_ascii_whitespace() || *c == b'\x0b'))
        .unwrap_or(value.len());
    let value = &value[start..];
    let (negative, digits) = match value.first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };

    digits
        .iter()
        .take_while(|c| c.is_ascii_digit())
        .fold(0i64, |acc, digit| {
            let digit = i64::from(digit - b'0');
            if negative {
                acc.saturating_mul(10).saturating_sub(digit)
            } else {
                acc.saturating_mul(10).saturating_add(digit)
            }
        })
}
