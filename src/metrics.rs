//! Request metrics for monitoring and observability.
//!
//! Counters are plain atomics updated once per request by the bridge. A
//! [`BridgeStats`] snapshot can be serialized, and [`BridgeMetrics::to_prometheus`]
//! renders the Prometheus text exposition format.

use crate::context::{ExecutionStatus, RequestOutcome};
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time copy of the bridge counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Requests that entered the bridge
    pub requests_started: u64,
    /// Requests whose script ran to completion
    pub requests_completed: u64,
    /// Requests where the engine reported an error
    pub script_failures: u64,
    /// Requests where the engine bailed out
    pub aborts: u64,
    /// Requests rejected before execution
    pub rejected: u64,
    /// Average bridge time per finished request in microseconds
    pub avg_duration_us: f64,
}

/// Metrics collector shared by every worker thread
pub struct BridgeMetrics {
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    script_failures: AtomicU64,
    aborts: AtomicU64,
    rejected: AtomicU64,
    total_duration_us: AtomicU64,
    rejections: parking_lot::Mutex<HashMap<ErrorCode, u64>>,
}

impl BridgeMetrics {
    /// Create a new collector
    pub fn new() -> Self {
        Self {
            requests_started: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            script_failures: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
            rejections: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Count a request entering the bridge
    pub fn record_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished request
    pub fn record(&self, outcome: &RequestOutcome) {
        let counter = match outcome.status {
            ExecutionStatus::Completed => &self.requests_completed,
            ExecutionStatus::ScriptFailed => &self.script_failures,
            ExecutionStatus::Aborted => &self.aborts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_duration_us
            .fetch_add(outcome.duration_us, Ordering::Relaxed);
    }

    /// Record a request rejected before execution
    pub fn record_rejected(&self, code: ErrorCode) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        *self.rejections.lock().entry(code).or_insert(0) += 1;
    }

    /// Get rejection counts by error code
    pub fn rejections(&self) -> HashMap<ErrorCode, u64> {
        self.rejections.lock().clone()
    }

    /// Take a snapshot of every counter
    pub fn snapshot(&self) -> BridgeStats {
        let completed = self.requests_completed.load(Ordering::Relaxed);
        let script_failures = self.script_failures.load(Ordering::Relaxed);
        let aborts = self.aborts.load(Ordering::Relaxed);
        let finished = completed + script_failures + aborts;
        let avg_duration_us = if finished == 0 {
            0.0
        } else {
            self.total_duration_us.load(Ordering::Relaxed) as f64 / finished as f64
        };

        BridgeStats {
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_completed: completed,
            script_failures,
            aborts,
            rejected: self.rejected.load(Ordering::Relaxed),
            avg_duration_us,
        }
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let stats = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP phpkd_requests_started_total Requests that entered the bridge\n");
        output.push_str("# TYPE phpkd_requests_started_total counter\n");
        output.push_str(&format!(
            "phpkd_requests_started_total {}\n",
            stats.requests_started
        ));

        output.push_str("\n# HELP phpkd_requests_total Finished requests by outcome\n");
        output.push_str("# TYPE phpkd_requests_total counter\n");
        for (status, count) in [
            (ExecutionStatus::Completed, stats.requests_completed),
            (ExecutionStatus::ScriptFailed, stats.script_failures),
            (ExecutionStatus::Aborted, stats.aborts),
        ] {
            output.push_str(&format!(
                "phpkd_requests_total{{status=\"{}\"}} {}\n",
                status, count
            ));
        }

        output.push_str("\n# HELP phpkd_request_duration_us Average bridge time per request\n");
        output.push_str("# TYPE phpkd_request_duration_us gauge\n");
        output.push_str(&format!(
            "phpkd_request_duration_us {:.2}\n",
            stats.avg_duration_us
        ));

        output.push_str("\n# HELP phpkd_rejected_total Requests rejected by error code\n");
        output.push_str("# TYPE phpkd_rejected_total counter\n");
        for (code, count) in self.rejections() {
            output.push_str(&format!(
                "phpkd_rejected_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for measuring bridge time
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in whole microseconds
    pub fn elapsed_us(&self) -> u64 {
        u64::try_from(self.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}
