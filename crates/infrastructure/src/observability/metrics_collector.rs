//! Metrics collector for the execution engine
//!
//! Built on the `metrics` facade; the embedding application installs the recorder.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

/// Metrics collector for the execution engine
#[derive(Clone)]
pub struct MetricsCollector {
    executions_total: Counter,
    execution_failures_total: Counter,
    execution_duration: Histogram,
    executions_in_flight: Gauge,

    claim_conflicts_total: Counter,
    heartbeat_failures_total: Counter,
    dead_executions_total: Counter,
    unresolved_deleted_total: Counter,
    stale_writes_discarded_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            executions_total: counter!("scheduler_executions_total"),
            execution_failures_total: counter!("scheduler_execution_failures_total"),
            execution_duration: histogram!("scheduler_execution_duration_seconds"),
            executions_in_flight: gauge!("scheduler_executions_in_flight"),
            claim_conflicts_total: counter!("scheduler_claim_conflicts_total"),
            heartbeat_failures_total: counter!("scheduler_heartbeat_failures_total"),
            dead_executions_total: counter!("scheduler_dead_executions_total"),
            unresolved_deleted_total: counter!("scheduler_unresolved_deleted_total"),
            stale_writes_discarded_total: counter!("scheduler_stale_writes_discarded_total"),
        }
    }

    /// Record a finished handler invocation
    pub fn record_execution(&self, task_name: &str, succeeded: bool, duration_seconds: f64) {
        self.executions_total.increment(1);
        self.execution_duration.record(duration_seconds);
        if !succeeded {
            self.execution_failures_total.increment(1);
        }

        debug!(
            task_name = task_name,
            succeeded = succeeded,
            duration_seconds = duration_seconds,
            "Execution finished"
        );
    }

    pub fn execution_started(&self) {
        self.executions_in_flight.increment(1.0);
    }

    pub fn execution_finished(&self) {
        self.executions_in_flight.decrement(1.0);
    }

    pub fn record_claim_conflict(&self) {
        self.claim_conflicts_total.increment(1);
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures_total.increment(1);
    }

    pub fn record_dead_execution(&self) {
        self.dead_executions_total.increment(1);
    }

    pub fn record_unresolved_deleted(&self, count: u64) {
        self.unresolved_deleted_total.increment(count);
    }

    pub fn record_stale_write_discarded(&self) {
        self.stale_writes_discarded_total.increment(1);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}
