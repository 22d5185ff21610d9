//! Smoke tests for the OTLP export path.
//!
//! These need an OTLP collector listening on localhost:4317.
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use opentelemetry::KeyValue;
use stagequeue::model::{MessageId, Stage, WorkerId};

static TELEMETRY: OnceLock<stagequeue::telemetry::TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static stagequeue::telemetry::TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        stagequeue::telemetry::init_telemetry(stagequeue::telemetry::TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "stagequeue-smoke-test".to_string(),
            log_level: "info".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give the exporters time to send.
async fn flush_and_wait(guard: &stagequeue::telemetry::TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(2)).await;
}

#[test]
#[ignore]
fn smoke_traces_metrics_and_logs() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        // Spans must be entered to be exported.
        {
            let span = stagequeue::telemetry::message::start_dispatch_span(
                &WorkerId::from("smoke"),
                MessageId(1),
                Stage::Ready,
            );
            let _enter = span.enter();
            stagequeue::telemetry::message::record_stage_transition(
                &span,
                Stage::Ready,
                Stage::Done,
            );
            stagequeue::telemetry::message::record_outcome(&span, "advanced");
        }

        stagequeue::telemetry::metrics::messages_claimed().add(3, &[]);
        stagequeue::telemetry::metrics::handler_duration_ms()
            .record(42.5, &[KeyValue::new("stage", "ready")]);

        tracing::info!(component = "smoke-test", "smoke test info log");
        tracing::warn!(component = "smoke-test", "smoke test warning log");

        flush_and_wait(guard).await;
    });
}
