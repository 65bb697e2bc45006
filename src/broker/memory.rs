//! In-process broker implementing both [`QueueBroker`] and [`TopicBroker`].
//!
//! Mirrors the delivery semantics the consumer relies on: long polling,
//! visibility timeouts with fresh receipt tokens per receive, delayed sends,
//! and topic fanout gated by queue policy and filter policy. Used as the
//! injected client in tests and local development.

use super::{
    MAX_RECEIVE_BATCH, MAX_WAIT_SECONDS, PublishRequest, QueueBroker, QueueInfo, ReceiveRequest,
    ReceivedMessage, SubscribeRequest, TopicBroker, WireAttribute, filter,
};
use crate::error::{Error, Result};
use crate::topic::policy::PolicyDocument;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

const ACCOUNT: &str = "000000000000";

/// URL the in-memory broker assigns to the queue called `name`.
pub fn queue_url(name: &str) -> String {
    format!("http://memory.local/{ACCOUNT}/{name}")
}

/// ARN the in-memory broker assigns to the queue called `name`.
pub fn queue_arn(name: &str) -> String {
    format!("arn:memory:sqs:local:{ACCOUNT}:{name}")
}

/// ARN for a topic called `name`. Topics need no creation step.
pub fn topic_arn(name: &str) -> String {
    format!("arn:memory:sns:local:{ACCOUNT}:{name}")
}

/// A topic → queue binding as recorded by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySubscription {
    pub topic_arn: String,
    pub endpoint: String,
    pub filter_policy: Value,
    pub raw_message_delivery: bool,
}

struct StoredMessage {
    id: String,
    body: String,
    attributes: BTreeMap<String, WireAttribute>,
    visible_at: Instant,
    receipt: Option<String>,
    receive_count: u32,
}

struct MemoryQueue {
    url: String,
    arn: String,
    policy: Option<String>,
    messages: VecDeque<StoredMessage>,
}

impl MemoryQueue {
    fn push(&mut self, body: String, attributes: BTreeMap<String, WireAttribute>, delay: Duration) {
        self.messages.push_back(StoredMessage {
            id: Uuid::new_v4().to_string(),
            body,
            attributes,
            visible_at: Instant::now() + delay,
            receipt: None,
            receive_count: 0,
        });
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    subscriptions: Vec<MemorySubscription>,
}

impl State {
    fn queue_by_url(&mut self, url: &str) -> Result<&mut MemoryQueue> {
        self.queues
            .values_mut()
            .find(|q| q.url == url)
            .ok_or_else(|| Error::NotFound(url.to_string()))
    }
}

/// In-memory broker. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
    delete_calls: AtomicUsize,
    policy_writes: AtomicUsize,
    subscribe_calls: AtomicUsize,
    failing_receives: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages in the queue, visible or not.
    pub fn message_count(&self, name: &str) -> usize {
        self.state()
            .queues
            .get(name)
            .map_or(0, |q| q.messages.len())
    }

    /// Messages in the queue that a receive could return right now.
    pub fn visible_count(&self, name: &str) -> usize {
        let now = Instant::now();
        self.state().queues.get(name).map_or(0, |q| {
            q.messages.iter().filter(|m| m.visible_at <= now).count()
        })
    }

    pub fn queue_policy(&self, name: &str) -> Option<String> {
        self.state()
            .queues
            .get(name)
            .and_then(|q| q.policy.clone())
    }

    pub fn subscriptions(&self, topic_arn: &str) -> Vec<MemorySubscription> {
        self.state()
            .subscriptions
            .iter()
            .filter(|s| s.topic_arn == topic_arn)
            .cloned()
            .collect()
    }

    /// Successful delete calls, including no-op deletes of stale receipts.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn policy_writes(&self) -> usize {
        self.policy_writes.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` receive calls fail with a broker error.
    pub fn fail_next_receives(&self, n: usize) {
        self.failing_receives.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Pop up to `max` visible messages, hiding them for `visibility`.
    /// Otherwise report when the next hidden message becomes visible.
    fn try_take(
        &self,
        url: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<(Vec<ReceivedMessage>, Option<Instant>)> {
        let mut state = self.state();
        let queue = state.queue_by_url(url)?;
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for message in queue.messages.iter_mut() {
            if message.visible_at <= now {
                if batch.len() < max {
                    let receipt = Uuid::new_v4().to_string();
                    message.receipt = Some(receipt.clone());
                    message.receive_count += 1;
                    message.visible_at = now + visibility;
                    batch.push(ReceivedMessage {
                        message_id: message.id.clone(),
                        body: message.body.clone(),
                        receipt_token: receipt,
                        attributes: message.attributes.clone(),
                        receive_count: message.receive_count,
                    });
                }
            } else {
                next_visible = Some(match next_visible {
                    Some(t) => t.min(message.visible_at),
                    None => message.visible_at,
                });
            }
        }
        Ok((batch, next_visible))
    }

    /// Body to enqueue for one subscription.
    fn delivery_body(
        request: &PublishRequest,
        payload: &str,
        raw: bool,
    ) -> Result<(String, BTreeMap<String, WireAttribute>)> {
        if raw {
            return Ok((payload.to_string(), request.attributes.clone()));
        }
        let attributes: serde_json::Map<String, Value> = request
            .attributes
            .iter()
            .map(|(name, a)| {
                (
                    name.clone(),
                    json!({ "Type": a.data_type, "Value": a.string_value }),
                )
            })
            .collect();
        let notification = json!({
            "Type": "Notification",
            "MessageId": Uuid::new_v4().to_string(),
            "TopicArn": request.topic_arn,
            "Message": payload,
            "Timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "MessageAttributes": attributes,
        });
        Ok((serde_json::to_string(&notification)?, BTreeMap::new()))
    }
}

/// Resolve the per-protocol payload of a publish call.
fn queue_payload(request: &PublishRequest) -> Result<String> {
    if request.message_structure.as_deref() != Some("json") {
        return Ok(request.message.clone());
    }
    let structured: Value = serde_json::from_str(&request.message)
        .map_err(|e| Error::Broker(format!("structured message is not JSON: {e}")))?;
    structured
        .get("sqs")
        .or_else(|| structured.get("default"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Broker("structured message has no default payload".to_string()))
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn resolve_queue(&self, name: &str) -> Result<QueueInfo> {
        self.state()
            .queues
            .get(name)
            .map(|q| QueueInfo {
                url: q.url.clone(),
                arn: q.arn.clone(),
                policy: q.policy.clone(),
            })
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn create_queue(&self, name: &str) -> Result<()> {
        self.state()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue {
                url: queue_url(name),
                arn: queue_arn(name),
                policy: None,
                messages: VecDeque::new(),
            });
        Ok(())
    }

    async fn receive(&self, url: &str, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        if self.take_injected_failure() {
            return Err(Error::Broker("receive failed (injected)".to_string()));
        }
        let max = request.max_messages.clamp(1, MAX_RECEIVE_BATCH) as usize;
        let visibility = Duration::from_secs(u64::from(request.visibility_timeout_seconds));
        let wait = Duration::from_secs(u64::from(request.wait_seconds.min(MAX_WAIT_SECONDS)));
        let deadline = Instant::now() + wait;

        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let (batch, next_visible) = self.try_take(url, max, visibility)?;
            if !batch.is_empty() {
                trace!(url, count = batch.len(), "received");
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(batch);
            }
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, url: &str, receipt_token: &str) -> Result<()> {
        let mut state = self.state();
        let queue = state.queue_by_url(url)?;
        queue
            .messages
            .retain(|m| m.receipt.as_deref() != Some(receipt_token));
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, url: &str, body: &str, delay_seconds: u32) -> Result<()> {
        {
            let mut state = self.state();
            let queue = state.queue_by_url(url)?;
            queue.push(
                body.to_string(),
                BTreeMap::new(),
                Duration::from_secs(u64::from(delay_seconds)),
            );
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn set_queue_policy(&self, url: &str, policy: &str) -> Result<()> {
        let mut state = self.state();
        let queue = state.queue_by_url(url)?;
        queue.policy = Some(policy.to_string());
        self.policy_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TopicBroker for MemoryBroker {
    async fn publish(&self, request: PublishRequest) -> Result<()> {
        let payload = queue_payload(&request)?;
        let mut delivered = 0usize;
        {
            let mut guard = self.state();
            let state = &mut *guard;
            for subscription in state
                .subscriptions
                .iter()
                .filter(|s| s.topic_arn == request.topic_arn)
            {
                if !filter::matches(&subscription.filter_policy, &request.attributes) {
                    continue;
                }
                let Some(queue) = state
                    .queues
                    .values_mut()
                    .find(|q| q.arn == subscription.endpoint)
                else {
                    continue;
                };
                let allowed = match PolicyDocument::parse_or_default(
                    queue.policy.as_deref(),
                    &queue.arn,
                ) {
                    Ok(policy) => policy.allows_topic(&request.topic_arn),
                    Err(_) => false,
                };
                if !allowed {
                    debug!(
                        topic = %request.topic_arn,
                        queue = %queue.arn,
                        "queue policy denies topic, dropping delivery"
                    );
                    continue;
                }
                let (body, attributes) =
                    Self::delivery_body(&request, &payload, subscription.raw_message_delivery)?;
                queue.push(body, attributes, Duration::ZERO);
                delivered += 1;
            }
        }
        trace!(topic = %request.topic_arn, delivered, "published");
        if delivered > 0 {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<()> {
        if request.protocol != "sqs" {
            return Err(Error::Broker(format!(
                "unsupported protocol: {}",
                request.protocol
            )));
        }
        let filter_policy: Value = if request.filter_policy.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&request.filter_policy)
                .map_err(|e| Error::Broker(format!("invalid filter policy: {e}")))?
        };
        let subscription = MemorySubscription {
            topic_arn: request.topic_arn,
            endpoint: request.endpoint,
            filter_policy,
            raw_message_delivery: request.raw_message_delivery,
        };
        {
            let mut state = self.state();
            state
                .subscriptions
                .retain(|s| !(s.topic_arn == subscription.topic_arn && s.endpoint == subscription.endpoint));
            state.subscriptions.push(subscription);
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
