//! # brokerq
//!
//! At-least-once background work over a durable queue/pub-sub broker.
//!
//! Provides a bounded worker pool, a queue consumer with one-shot and
//! continuous modes, a decoder for direct and topic-fanout message
//! envelopes, and a topic client that wires queues to topics by merging
//! access policies idempotently. Broker clients are injected; an in-memory
//! broker is included for tests and local development.

pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod queue;
pub mod telemetry;
pub mod topic;

pub use envelope::{AttributeValue, Attributes, MessageEnvelope};
pub use error::{Error, Result};
pub use pool::Pool;
pub use queue::{ConsumeOptions, Disposition, Handler, Queue};
pub use topic::{MessageFilter, OutgoingMessage, Topic};
