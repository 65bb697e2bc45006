//! Message handling span helpers.
//!
//! One span per received message, covering decode, handler execution and
//! acknowledgement.

use tracing::Span;

/// Start a span for handling one received message.
///
/// The `message.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_message_span(queue: &str, message_id: &str, receive_count: u32) -> Span {
    tracing::info_span!(
        "message.handle",
        "messaging.destination.name" = queue,
        "messaging.message.id" = message_id,
        "message.receive_count" = receive_count,
        "message.outcome" = tracing::field::Empty,
    )
}

/// Record how the message was disposed of.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("message.outcome", outcome);
}
