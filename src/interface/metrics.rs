//! Engine metrics
//!
//! The library only records through the `metrics` facade. Installing an
//! exporter is left to the embedding application.

use crate::domain::capability::{CapabilityBinding, Intent};
use crate::domain::transfer::{TransferKind, TransferPhase};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Register metric descriptions with whatever recorder is installed
pub fn describe_metrics() {
    describe_counter!(
        "softphone_binding_attempts_total",
        "Capability binding attempts by intent, binding and result"
    );
    describe_histogram!(
        "softphone_binding_duration_seconds",
        "Time spent in one capability-bound backend call"
    );
    describe_counter!(
        "softphone_capability_exhausted_total",
        "Intents for which no binding succeeded"
    );
    describe_counter!(
        "softphone_transfers_total",
        "Transfer attempts by kind and terminal phase"
    );
    describe_gauge!(
        "softphone_active_conferences",
        "Number of conferences that have not terminated"
    );
    describe_gauge!("softphone_live_legs", "Number of live call legs");
    describe_counter!(
        "softphone_cleanup_failures_total",
        "Secondary teardown failures reported as warnings"
    );
}

/// Record one binding attempt
pub fn record_binding_attempt(
    intent: Intent,
    binding: CapabilityBinding,
    success: bool,
    elapsed: Duration,
) {
    counter!(
        "softphone_binding_attempts_total",
        "intent" => intent.as_str(),
        "binding" => binding.as_str(),
        "success" => success.to_string()
    )
    .increment(1);
    histogram!(
        "softphone_binding_duration_seconds",
        "intent" => intent.as_str()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_capability_exhausted(intent: Intent) {
    counter!("softphone_capability_exhausted_total", "intent" => intent.as_str()).increment(1);
}

/// Record a transfer reaching a terminal phase
pub fn record_transfer_finished(kind: TransferKind, phase: TransferPhase) {
    let kind = match kind {
        TransferKind::Unattended => "unattended",
        TransferKind::Attended => "attended",
    };
    counter!("softphone_transfers_total", "kind" => kind, "phase" => phase.as_str()).increment(1);
}

pub fn update_active_conferences(count: usize) {
    gauge!("softphone_active_conferences").set(count as f64);
}

pub fn update_live_legs(count: usize) {
    gauge!("softphone_live_legs").set(count as f64);
}

pub fn record_cleanup_failure() {
    counter!("softphone_cleanup_failures_total").increment(1);
}
