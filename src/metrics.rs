//! Metrics instrumentation for dns-masquerade.
//!
//! All metrics are prefixed with `dns_masquerade.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record one reconciliation pass.
pub fn record_reconcile(outcome: ReconcileOutcome, duration: std::time::Duration) {
    let outcome_str = match outcome {
        ReconcileOutcome::Initialized => "initialized",
        ReconcileOutcome::Processing => "processing",
        ReconcileOutcome::Ready => "ready",
        ReconcileOutcome::DeletionBlocked => "deletion_blocked",
        ReconcileOutcome::Deleting => "deleting",
        ReconcileOutcome::Finalized => "finalized",
        ReconcileOutcome::Gone => "gone",
        ReconcileOutcome::Retry => "retry",
        ReconcileOutcome::Error => "error",
    };

    counter!("dns_masquerade.reconcile.count", "outcome" => outcome_str).increment(1);
    histogram!("dns_masquerade.reconcile.duration.seconds").record(duration.as_secs_f64());
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// State was unset and has been initialized.
    Initialized,
    /// Artifact written, deferred, or not yet converged.
    Processing,
    /// Record converged.
    Ready,
    /// Deletion waits for foreign finalizers.
    DeletionBlocked,
    /// Rule removed from the artifact.
    Deleting,
    /// Finalizer released.
    Finalized,
    /// Object no longer exists.
    Gone,
    /// Transient failure, retried silently.
    Retry,
    /// Failure surfaced as `Error` state.
    Error,
}

/// Record a write of the shared artifact.
pub fn record_artifact_write(created: bool) {
    let op = if created { "create" } else { "update" };
    counter!("dns_masquerade.artifact.write.count", "op" => op).increment(1);
}

/// Record an artifact write held back by the debounce window.
pub fn record_debounce_deferral() {
    counter!("dns_masquerade.artifact.debounce_deferral.count").increment(1);
}

/// Record an optimistic-concurrency conflict.
pub fn record_write_conflict() {
    counter!("dns_masquerade.store.write_conflict.count").increment(1);
}

/// Record the rule counts of the last written artifact.
pub fn record_rule_counts(addresses: usize, names: usize) {
    gauge!("dns_masquerade.artifact.rules", "target" => "address").set(addresses as f64);
    gauge!("dns_masquerade.artifact.rules", "target" => "name").set(names as f64);
}

/// Record a per-endpoint convergence probe.
pub fn record_probe(result: ProbeResult, tunneled: bool, duration: std::time::Duration) {
    let result_str = match result {
        ProbeResult::Active => "active",
        ProbeResult::Inactive => "inactive",
        ProbeResult::Error => "error",
        ProbeResult::Cancelled => "cancelled",
    };
    let path = if tunneled { "tunnel" } else { "direct" };

    counter!("dns_masquerade.probe.count", "result" => result_str, "path" => path).increment(1);
    histogram!("dns_masquerade.probe.duration.seconds", "path" => path)
        .record(duration.as_secs_f64());
}

/// Probe result type for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// Server answers as declared.
    Active,
    /// Server answers differently.
    Inactive,
    /// Technical failure.
    Error,
    /// Aborted by shutdown.
    Cancelled,
}

/// Record a change notification seen by the controller.
pub fn record_watch_event(kind: &'static str, enqueued: bool) {
    let action = if enqueued { "enqueued" } else { "filtered" };
    counter!("dns_masquerade.watch.event.count", "kind" => kind, "action" => action).increment(1);
}

/// Record the number of keys waiting in the work queue.
pub fn record_queue_depth(depth: usize) {
    gauge!("dns_masquerade.queue.depth").set(depth as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
