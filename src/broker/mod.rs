//! Broker client contracts.
//!
//! The durable queue/pub-sub service lives outside this crate. Everything
//! the crate needs from it goes through [`QueueBroker`] and
//! [`TopicBroker`]; clients are constructed by the caller and injected as
//! `Arc<dyn ...>` so tests can swap in [`memory::MemoryBroker`].

pub mod filter;
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest long-poll wait the broker honors, in seconds.
pub const MAX_WAIT_SECONDS: u32 = 20;

/// Largest batch a single receive may return.
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Wire data type for string attributes.
pub const STRING_TYPE: &str = "String";
/// Wire data type for numeric attributes.
pub const NUMBER_TYPE: &str = "Number";
/// Wire data type for string-array attributes.
pub const STRING_ARRAY_TYPE: &str = "String.Array";

/// A resolved queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub url: String,
    pub arn: String,
    /// Raw access policy JSON, if one has been set.
    pub policy: Option<String>,
}

/// Parameters for a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub wait_seconds: u32,
    pub max_messages: u32,
    pub visibility_timeout_seconds: u32,
}

/// A typed attribute as it travels over the wire: a data type tag and a
/// string rendering of the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireAttribute {
    pub data_type: String,
    pub string_value: String,
}

impl WireAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: STRING_TYPE.to_string(),
            string_value: value.into(),
        }
    }

    pub fn number(value: &serde_json::Number) -> Self {
        Self {
            data_type: NUMBER_TYPE.to_string(),
            string_value: value.to_string(),
        }
    }

    pub fn string_array(values: &[String]) -> Result<Self> {
        Ok(Self {
            data_type: STRING_ARRAY_TYPE.to_string(),
            string_value: serde_json::to_string(values)?,
        })
    }
}

/// A message handed out by a receive call. Hidden from other receivers
/// until deleted or until its visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    /// Opaque token identifying this particular receipt; needed to delete.
    pub receipt_token: String,
    /// Broker-level message attributes (present on raw topic delivery).
    pub attributes: BTreeMap<String, WireAttribute>,
    pub receive_count: u32,
}

/// A publish call against a topic.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic_arn: String,
    pub message: String,
    pub attributes: BTreeMap<String, WireAttribute>,
    /// `Some("json")` when `message` holds per-protocol payloads.
    pub message_structure: Option<String>,
}

/// A subscribe call binding a topic to an endpoint.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub topic_arn: String,
    pub protocol: String,
    pub endpoint: String,
    /// Filter policy JSON.
    pub filter_policy: String,
    pub raw_message_delivery: bool,
}

/// Queue primitives consumed by the crate.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Look up a queue by name. Fails with [`crate::error::Error::NotFound`]
    /// if it does not exist.
    async fn resolve_queue(&self, name: &str) -> Result<QueueInfo>;

    /// Create a queue (idempotent).
    async fn create_queue(&self, name: &str) -> Result<()>;

    /// Receive up to `max_messages`, waiting at most `wait_seconds`.
    /// Returns an empty batch on timeout.
    async fn receive(&self, url: &str, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>>;

    /// Delete a received message. No-op if it is already gone.
    async fn delete(&self, url: &str, receipt_token: &str) -> Result<()>;

    /// Enqueue a message body, optionally delayed.
    async fn send(&self, url: &str, body: &str, delay_seconds: u32) -> Result<()>;

    /// Replace the queue's access policy.
    async fn set_queue_policy(&self, url: &str, policy: &str) -> Result<()>;
}

/// Topic primitives consumed by the crate.
#[async_trait]
pub trait TopicBroker: Send + Sync {
    async fn publish(&self, request: PublishRequest) -> Result<()>;

    /// Bind a topic to an endpoint (idempotent at the broker).
    async fn subscribe(&self, request: SubscribeRequest) -> Result<()>;
}
