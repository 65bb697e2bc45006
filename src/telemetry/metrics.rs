//! Metric instrument factories for brokerq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"brokerq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for brokerq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("brokerq")
}

/// Counter: broker-level queue operations (receive, delete, send, set_policy).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("brokerq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: topic operations (publish, subscribe, policy_merge).
/// Labels: `topic`, `operation`.
pub fn topic_operations() -> Counter<u64> {
    meter()
        .u64_counter("brokerq.topic.operations")
        .with_description("Number of topic operations")
        .build()
}

/// Counter: received messages by disposition.
/// Labels: `queue`, `outcome` ("handled" | "stale" | "malformed" | "failed").
pub fn messages_processed() -> Counter<u64> {
    meter()
        .u64_counter("brokerq.messages.processed")
        .with_description("Number of received messages by outcome")
        .build()
}

/// Counter: tasks finished by pool workers.
/// Labels: `outcome` ("ok" | "error" | "panic").
pub fn pool_tasks() -> Counter<u64> {
    meter()
        .u64_counter("brokerq.pool.tasks")
        .with_description("Number of pool tasks executed")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("brokerq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
