//! Topic client: attributed publishing and queue subscription.

pub mod filter;
pub mod policy;

pub use filter::{Comparison, MessageFilter, NumberFilter, StringFilter};
pub use policy::PolicyDocument;

use crate::broker::{
    PublishRequest, QueueBroker, QueueInfo, SubscribeRequest, TopicBroker, WireAttribute,
};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::Number;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// A message to publish, with optional typed attributes the broker can
/// filter on.
#[derive(Debug, Clone)]
pub struct OutgoingMessage<T> {
    pub body: T,
    pub string_attributes: BTreeMap<String, String>,
    pub number_attributes: BTreeMap<String, Number>,
    pub array_attributes: BTreeMap<String, Vec<String>>,
}

impl<T> OutgoingMessage<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            string_attributes: BTreeMap::new(),
            number_attributes: BTreeMap::new(),
            array_attributes: BTreeMap::new(),
        }
    }

    pub fn string_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.string_attributes.insert(name.into(), value.into());
        self
    }

    pub fn number_attribute(mut self, name: impl Into<String>, value: impl Into<Number>) -> Self {
        self.number_attributes.insert(name.into(), value.into());
        self
    }

    pub fn array_attribute(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.array_attributes.insert(name.into(), values);
        self
    }

    /// Wire form of all attributes. Later kinds overwrite earlier ones on a
    /// name clash: strings, then numbers, then arrays.
    fn wire_attributes(&self) -> Result<BTreeMap<String, WireAttribute>> {
        let mut attributes = BTreeMap::new();
        for (name, value) in &self.string_attributes {
            attributes.insert(name.clone(), WireAttribute::string(value.clone()));
        }
        for (name, value) in &self.number_attributes {
            attributes.insert(name.clone(), WireAttribute::number(value));
        }
        for (name, values) in &self.array_attributes {
            attributes.insert(name.clone(), WireAttribute::string_array(values)?);
        }
        Ok(attributes)
    }
}

/// A typed handle on one broker topic.
pub struct Topic<T> {
    queues: Arc<dyn QueueBroker>,
    topics: Arc<dyn TopicBroker>,
    arn: String,
    _payload: PhantomData<fn(T)>,
}

impl<T> Topic<T> {
    pub fn new(
        queues: Arc<dyn QueueBroker>,
        topics: Arc<dyn TopicBroker>,
        arn: impl Into<String>,
    ) -> Self {
        Self {
            queues,
            topics,
            arn: arn.into(),
            _payload: PhantomData,
        }
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    fn record(&self, operation: &'static str) {
        metrics::topic_operations().add(
            1,
            &[
                KeyValue::new("topic", self.arn.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    /// Resolve the named queue, creating it first if it cannot be found.
    async fn resolve_or_create(&self, queue_name: &str) -> Result<QueueInfo> {
        match self.queues.resolve_queue(queue_name).await {
            Ok(queue) => Ok(queue),
            Err(e) => {
                debug!(queue = queue_name, error = %e, "queue not resolvable, creating");
                self.queues
                    .create_queue(queue_name)
                    .await
                    .map_err(|e| Error::Setup(format!("cannot create queue {queue_name}: {e}")))?;
                self.queues
                    .resolve_queue(queue_name)
                    .await
                    .map_err(|e| Error::Setup(format!("cannot resolve queue {queue_name}: {e}")))
            }
        }
    }

    /// Attach the named queue to this topic. Safe to repeat: the queue's
    /// access policy gains at most one statement for this topic, and is
    /// only written when that statement is missing. The subscription uses
    /// raw delivery and the merged `filter`.
    pub async fn subscribe(&self, queue_name: &str, filter: &MessageFilter) -> Result<()> {
        let queue = self.resolve_or_create(queue_name).await?;

        let mut policy = PolicyDocument::parse_or_default(queue.policy.as_deref(), &queue.arn)?;
        if policy.grant_topic(&queue.arn, &self.arn) {
            self.queues
                .set_queue_policy(&queue.url, &policy.to_json()?)
                .await?;
            self.record("policy_merge");
            info!(topic = %self.arn, queue = %queue.arn, "granted topic delivery on queue policy");
        } else {
            debug!(topic = %self.arn, queue = %queue.arn, "queue policy already grants topic");
        }

        self.topics
            .subscribe(SubscribeRequest {
                topic_arn: self.arn.clone(),
                protocol: "sqs".to_string(),
                endpoint: queue.arn.clone(),
                filter_policy: filter.policy_json()?,
                raw_message_delivery: true,
            })
            .await?;
        self.record("subscribe");
        info!(topic = %self.arn, queue = %queue.arn, "queue subscribed");
        Ok(())
    }
}

impl<T: Serialize> Topic<T> {
    /// Publish a message. The JSON body is offered under both the `default`
    /// and `sqs` keys so raw and wrapped subscribers decode the same
    /// payload. Broker errors are returned to the caller.
    pub async fn publish(&self, message: OutgoingMessage<T>) -> Result<()> {
        let attributes = message.wire_attributes()?;
        let json = serde_json::to_string(&message.body)?;
        let structured = serde_json::json!({ "default": json, "sqs": json });
        self.topics
            .publish(PublishRequest {
                topic_arn: self.arn.clone(),
                message: serde_json::to_string(&structured)?,
                attributes,
                message_structure: Some("json".to_string()),
            })
            .await?;
        self.record("publish");
        debug!(topic = %self.arn, "message published");
        Ok(())
    }
}
