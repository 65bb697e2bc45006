//! Queue consumer: produce, one-shot consume, and continuous polling.
//!
//! Delivery is at-least-once. A message is deleted only after its handler
//! returns `Ok`, or when it is discarded as stale or malformed. A handler
//! error leaves the message alone; the broker makes it visible again once
//! the visibility timeout (`retry_seconds`) lapses. Handlers must therefore
//! tolerate duplicates.

use crate::broker::{
    MAX_RECEIVE_BATCH, MAX_WAIT_SECONDS, QueueBroker, ReceiveRequest, ReceivedMessage,
};
use crate::envelope::{self, Attributes, Decoded};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::telemetry::message::{record_outcome, start_message_span};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

/// Pause after a failed receive before a poll loop tries again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Pause after a receive fails for a non-broker reason, such as the queue
/// no longer existing.
const SETUP_BACKOFF: Duration = Duration::from_secs(10);

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Long-poll wait for a receive, in seconds.
    pub wait_seconds: u32,
    /// Visibility timeout, in seconds: how long a failed message stays
    /// hidden before it is redelivered.
    pub retry_seconds: u32,
    /// Maximum age of a topic notification in milliseconds; older ones are
    /// discarded. Zero disables the check.
    pub max_diff_ms: u64,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            wait_seconds: 10,
            retry_seconds: 10,
            max_diff_ms: 0,
        }
    }
}

impl ConsumeOptions {
    pub fn wait_seconds(mut self, seconds: u32) -> Self {
        self.wait_seconds = seconds;
        self
    }

    pub fn retry_seconds(mut self, seconds: u32) -> Self {
        self.retry_seconds = seconds;
        self
    }

    pub fn max_diff_ms(mut self, ms: u64) -> Self {
        self.max_diff_ms = ms;
        self
    }
}

/// Processes one decoded message. Must be idempotent.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, message: T, attributes: Attributes) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T, Attributes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: T, attributes: Attributes) -> anyhow::Result<()> {
        (self)(message, attributes).await
    }
}

/// What happened to a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded; deleted.
    Handled,
    /// Notification older than `max_diff_ms`; deleted without handling.
    Stale,
    /// Undecodable body; deleted without handling.
    Malformed,
    /// Handler failed; left for redelivery.
    Failed,
}

impl Disposition {
    /// Whether the message is deleted.
    pub fn acknowledges(self) -> bool {
        !matches!(self, Disposition::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Handled => "handled",
            Disposition::Stale => "stale",
            Disposition::Malformed => "malformed",
            Disposition::Failed => "failed",
        }
    }
}

/// Broker-facing half of a queue, shared with the poll loops.
struct Consumer {
    broker: Arc<dyn QueueBroker>,
    name: String,
    url: String,
    concurrency: usize,
    /// One permit per message being processed, across `consume` calls and
    /// poll loops alike.
    gate: Semaphore,
}

impl Consumer {
    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    async fn fetch(&self, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        match self.broker.receive(&self.url, request).await {
            Ok(batch) => {
                self.record(if batch.is_empty() {
                    "receive_empty"
                } else {
                    "receive"
                });
                Ok(batch)
            }
            Err(e) => {
                warn!(queue = %self.name, error = %e, "receive failed");
                self.record("receive_error");
                Err(e)
            }
        }
    }

    async fn ack(&self, receipt_token: &str) {
        match self.broker.delete(&self.url, receipt_token).await {
            Ok(()) => self.record("delete"),
            Err(e) => {
                // The message comes back after its visibility timeout.
                warn!(queue = %self.name, error = %e, "delete failed");
                self.record("delete_error");
            }
        }
    }

    /// Decode, dispatch and acknowledge one message.
    async fn process<T, H>(
        &self,
        handler: &Arc<H>,
        raw: ReceivedMessage,
        options: ConsumeOptions,
    ) -> Disposition
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + ?Sized,
    {
        let span = start_message_span(&self.name, &raw.message_id, raw.receive_count);
        async {
            let Ok(_permit) = self.gate.acquire().await else {
                // Closed gate: nothing is deleted, the broker redelivers.
                return Disposition::Failed;
            };
            let disposition = match envelope::decode::<T>(&raw, options.max_diff_ms) {
                Err(e) => {
                    warn!(error = %e, "discarding malformed message");
                    Disposition::Malformed
                }
                Ok(Decoded::Stale { topic_arn, age_ms }) => {
                    info!(topic = %topic_arn, age_ms, "discarding stale message");
                    Disposition::Stale
                }
                Ok(Decoded::Fresh(envelope)) => {
                    if let Some(ref topic) = envelope.source_topic_arn {
                        debug!(topic = %topic, "message received from topic");
                    }
                    let started = Instant::now();
                    let handler = Arc::clone(handler);
                    // Spawned so a panicking handler cannot take the poll
                    // loop down with it.
                    let result = tokio::spawn(async move {
                        handler.handle(envelope.body, envelope.attributes).await
                    })
                    .await;
                    metrics::operation_duration_ms().record(
                        started.elapsed().as_secs_f64() * 1000.0,
                        &[KeyValue::new("operation", "message.handle")],
                    );
                    match result {
                        Ok(Ok(())) => Disposition::Handled,
                        Ok(Err(e)) => {
                            error!(error = %e, "handler failed, leaving message for redelivery");
                            Disposition::Failed
                        }
                        Err(e) => {
                            error!(error = %e, "handler panicked, leaving message for redelivery");
                            Disposition::Failed
                        }
                    }
                }
            };

            record_outcome(&tracing::Span::current(), disposition.as_str());
            metrics::messages_processed().add(
                1,
                &[
                    KeyValue::new("queue", self.name.clone()),
                    KeyValue::new("outcome", disposition.as_str()),
                ],
            );
            if disposition.acknowledges() {
                self.ack(&raw.receipt_token).await;
            }
            disposition
        }
        .instrument(span)
        .await
    }

    /// One continuous consumer: receive a single message, process it,
    /// repeat until shutdown.
    async fn poll_loop<T, H>(
        &self,
        slot: usize,
        handler: Arc<H>,
        options: ConsumeOptions,
        wait_seconds: u32,
        mut shutdown: watch::Receiver<bool>,
    ) where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + ?Sized,
    {
        let request = ReceiveRequest {
            wait_seconds,
            max_messages: 1,
            visibility_timeout_seconds: options.retry_seconds,
        };
        debug!(queue = %self.name, slot, wait_seconds, "poll loop started");

        while !*shutdown.borrow() {
            let received = tokio::select! {
                received = self.fetch(request) => received,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            match received {
                Ok(batch) => {
                    for raw in batch {
                        self.process::<T, H>(&handler, raw, options).await;
                    }
                }
                Err(e) => {
                    let pause = if e.is_transient() {
                        RECEIVE_BACKOFF
                    } else {
                        error!(queue = %self.name, slot, error = %e, "queue unusable, backing off");
                        SETUP_BACKOFF
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = shutdown.wait_for(|stop| *stop) => break,
                    }
                }
            }
        }
        debug!(queue = %self.name, slot, "poll loop stopped");
    }
}

/// A typed handle on one broker queue.
pub struct Queue<T> {
    consumer: Arc<Consumer>,
    pool: Pool,
    shutdown: watch::Sender<bool>,
    /// Set by `start_pool`, cleared by `drain` once a shutdown completes.
    running: AtomicBool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Queue<T> {
    /// Attach to a queue by name or URL. Anything starting with `http` is
    /// taken as a URL; a name is resolved through the broker and must
    /// already exist.
    pub async fn connect(
        broker: Arc<dyn QueueBroker>,
        name_or_url: &str,
        concurrency: usize,
    ) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::Config("queue concurrency must be at least 1".to_string()));
        }
        let (name, url) = if name_or_url.starts_with("http") {
            let name = name_or_url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(name_or_url);
            (name.to_string(), name_or_url.to_string())
        } else {
            let info = broker.resolve_queue(name_or_url).await.map_err(|e| {
                Error::Setup(format!("cannot resolve queue {name_or_url}: {e}"))
            })?;
            (name_or_url.to_string(), info.url)
        };
        let pool = Pool::new(concurrency)?;
        let (shutdown, _) = watch::channel(false);
        debug!(queue = %name, %url, concurrency, "queue connected");
        Ok(Self {
            consumer: Arc::new(Consumer {
                broker,
                name,
                url,
                concurrency,
                gate: Semaphore::new(concurrency),
            }),
            pool,
            shutdown,
            running: AtomicBool::new(false),
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.consumer.name
    }

    pub fn url(&self) -> &str {
        &self.consumer.url
    }

    pub fn concurrency(&self) -> usize {
        self.consumer.concurrency
    }

    /// Ask every poll loop started by [`Queue::start_pool`] to stop. A
    /// handler already running finishes; a pending receive is abandoned.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until every poll loop has exited. After a [`Queue::shutdown`]
    /// this also allows [`Queue::start_pool`] to be called again.
    pub async fn drain(&self) {
        self.pool.drain().await;
        if *self.shutdown.borrow() {
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

impl<T: Serialize> Queue<T> {
    /// Enqueue a message. Broker errors are returned; retrying is up to
    /// the caller.
    pub async fn produce(&self, message: &T, delay_seconds: u32) -> Result<()> {
        let body = serde_json::to_string(message)?;
        self.consumer
            .broker
            .send(&self.consumer.url, &body, delay_seconds)
            .await?;
        self.consumer.record("send");
        debug!(queue = %self.consumer.name, delay_seconds, "message produced");
        Ok(())
    }
}

impl<T> Queue<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Run one receive cycle: long-poll once, process up to `concurrency`
    /// messages concurrently, and return their dispositions. A failed
    /// receive yields an empty batch. The concurrency limit is shared with
    /// other `consume` calls and any running poll loops on this queue.
    pub async fn consume<H>(&self, handler: Arc<H>, options: ConsumeOptions) -> Vec<Disposition>
    where
        H: Handler<T> + ?Sized,
    {
        let request = ReceiveRequest {
            wait_seconds: options.wait_seconds.min(MAX_WAIT_SECONDS),
            max_messages: u32::try_from(self.consumer.concurrency)
                .unwrap_or(MAX_RECEIVE_BATCH)
                .min(MAX_RECEIVE_BATCH),
            visibility_timeout_seconds: options.retry_seconds,
        };
        let batch = self.consumer.fetch(request).await.unwrap_or_default();
        if batch.is_empty() {
            return Vec::new();
        }

        let mut tasks = JoinSet::new();
        for raw in batch {
            let consumer = Arc::clone(&self.consumer);
            let handler = Arc::clone(&handler);
            tasks.spawn(async move { consumer.process::<T, H>(&handler, raw, options).await });
        }
        let mut dispositions = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(disposition) => dispositions.push(disposition),
                Err(e) => error!(queue = %self.consumer.name, error = %e, "message task aborted"),
            }
        }
        dispositions
    }

    /// Start `concurrency` independent poll loops on the queue's pool and
    /// return. Loop 0 long-polls for `wait_seconds` to stay responsive when
    /// traffic is light; the rest use the broker maximum so idle loops make
    /// fewer requests.
    ///
    /// Fails with [`Error::AlreadyConsuming`] while loops from an earlier
    /// call are still registered; stop them with [`Queue::shutdown`] and
    /// [`Queue::drain`] first.
    pub async fn start_pool<H>(&self, handler: Arc<H>, options: ConsumeOptions) -> Result<()>
    where
        H: Handler<T> + ?Sized,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyConsuming(self.consumer.name.clone()));
        }
        self.shutdown.send_replace(false);

        for slot in 0..self.consumer.concurrency {
            let wait_seconds = if slot == 0 {
                options.wait_seconds.min(MAX_WAIT_SECONDS)
            } else {
                MAX_WAIT_SECONDS
            };
            let consumer = Arc::clone(&self.consumer);
            let handler = Arc::clone(&handler);
            let shutdown = self.shutdown.subscribe();
            self.pool
                .submit(async move {
                    consumer
                        .poll_loop::<T, H>(slot, handler, options, wait_seconds, shutdown)
                        .await;
                    Ok(())
                })
                .await?;
        }
        info!(
            queue = %self.consumer.name,
            concurrency = self.consumer.concurrency,
            "consumer started"
        );
        Ok(())
    }
}
