//! Integration tests for telemetry initialization and span helpers.

use stagequeue::model::{MessageId, Stage, WorkerId};
use stagequeue::telemetry::message;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = stagequeue::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "stagequeue-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = stagequeue::telemetry::init_telemetry(config);
}

#[test]
fn dispatch_span_records_outcome_and_transition() {
    let worker = WorkerId::from("w1");
    let span = message::start_dispatch_span(&worker, MessageId(7), Stage::Uploaded);
    message::record_stage_transition(&span, Stage::Uploaded, Stage::Ready);
    message::record_outcome(&span, "advanced");
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    use opentelemetry::KeyValue;
    use stagequeue::telemetry::metrics;

    metrics::messages_submitted().add(1, &[]);
    metrics::stage_transitions().add(
        1,
        &[
            KeyValue::new("from", "uploaded"),
            KeyValue::new("to", "ready"),
            KeyValue::new("result", "advanced"),
        ],
    );
    metrics::handler_duration_ms().record(1.5, &[KeyValue::new("stage", "ready")]);
}
