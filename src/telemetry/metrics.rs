//! Metric instrument factories for stagequeue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"stagequeue"` meter. With no
//! provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for stagequeue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("stagequeue")
}

/// Counter: payloads handed to the intake buffer.
pub fn messages_submitted() -> Counter<u64> {
    meter()
        .u64_counter("stagequeue.intake.submitted")
        .with_description("Payloads submitted to the intake buffer")
        .build()
}

/// Counter: payloads persisted by a flush.
/// Labels: `result` ("ok" | "requeued").
pub fn messages_inserted() -> Counter<u64> {
    meter()
        .u64_counter("stagequeue.intake.inserted")
        .with_description("Intake payloads flushed to the store")
        .build()
}

/// Counter: payloads that exhausted their insert attempts.
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("stagequeue.intake.dead_letters")
        .with_description("Payloads dead-lettered after repeated insert failures")
        .build()
}

/// Counter: messages claimed by `claim_batch`.
pub fn messages_claimed() -> Counter<u64> {
    meter()
        .u64_counter("stagequeue.claim.messages")
        .with_description("Messages claimed by workers")
        .build()
}

/// Counter: stage handler outcomes.
/// Labels: `from`, `to`, `result` ("advanced" | "stale").
pub fn stage_transitions() -> Counter<u64> {
    meter()
        .u64_counter("stagequeue.stage.transitions")
        .with_description("Stage transitions attempted by handlers")
        .build()
}

/// Counter: stage handler failures.
/// Labels: `stage`, `action` ("retry" | "release").
pub fn handler_failures() -> Counter<u64> {
    meter()
        .u64_counter("stagequeue.stage.failures")
        .with_description("Stage handler failures")
        .build()
}

/// Counter: store errors seen at the worker boundary.
/// Labels: `operation`, `kind` ("unavailable" | "other").
pub fn store_errors() -> Counter<u64> {
    meter()
        .u64_counter("stagequeue.store.errors")
        .with_description("Queue store errors")
        .build()
}

/// Histogram: stage handler duration in milliseconds.
/// Labels: `stage`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("stagequeue.stage.duration_ms")
        .with_description("Stage handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
