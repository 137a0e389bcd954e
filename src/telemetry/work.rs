//! Call execution span helpers.
//!
//! Provides span creation and attempt/state recording for work items
//! flowing through the queue.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for one item's execution, covering every attempt.
///
/// `call.attempts` is declared empty and filled by [`record_attempt`].
pub fn start_call_span(work_id: WorkId, estimated_tokens: u64) -> Span {
    tracing::info_span!(
        "dispatch.call",
        "work.id" = %work_id,
        "call.estimated_tokens" = estimated_tokens,
        "call.attempts" = tracing::field::Empty,
    )
}

/// Record the number of attempts made so far on a call span.
pub fn record_attempt(span: &Span, attempt: u32) {
    span.record("call.attempts", attempt);
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
