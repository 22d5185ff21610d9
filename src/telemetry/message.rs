//! Per-message span helpers.

use tracing::Span;

use crate::model::{MessageId, Stage, WorkerId};

/// Start a span for one dispatch of a message to its stage handler.
///
/// `message.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_dispatch_span(worker: &WorkerId, id: MessageId, stage: Stage) -> Span {
    tracing::info_span!(
        "message.dispatch",
        "worker.id" = %worker,
        "message.id" = id.0,
        "message.stage" = %stage,
        "message.outcome" = tracing::field::Empty,
    )
}

/// Record how a dispatch ended on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("message.outcome", outcome);
}

/// Emit a stage transition event scoped to the given span.
pub fn record_stage_transition(span: &Span, from: Stage, to: Stage) {
    span.in_scope(|| {
        tracing::info!(%from, %to, "stage_transition");
    });
}
