//! Queue consumers
//!
//! A [`MessageConsumer`] pulls deliveries from one queue with a fixed pool of
//! workers sharing a single delivery stream. Failed messages are retried by
//! republishing a copy to the same queue with `x-retry-count` incremented;
//! once the count reaches `max_retries` the delivery is nacked without
//! requeue and the broker dead-letters it.
//!
//! ## Retry guarantee
//!
//! The original delivery is acked only after its retry copy was accepted by
//! the broker. If the republish fails the original is nacked instead, so a
//! failed message is never silently lost (at-least-once).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{Broker, Delivery, DeliveryStream, Headers};

use super::error::{ConsumerError, ConsumerResult};

const BASE_RETRY_DELAY_MS: u64 = 100;
const MAX_RETRY_DELAY_MS: u64 = 5000;

/// Delay before republishing a message that has been retried
/// `retry_count` times: `min(5000ms, 100ms * 2^retry_count)`
pub fn retry_delay(retry_count: u32) -> Duration {
    let factor = 1u64.checked_shl(retry_count.min(63)).unwrap_or(u64::MAX);
    let millis = BASE_RETRY_DELAY_MS
        .saturating_mul(factor)
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(millis)
}

/// Consumer settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub consumer_tag: String,
    /// Unacked deliveries the broker may push ahead (>= 1)
    pub prefetch_count: u16,
    /// Concurrent handler invocations (>= 1)
    pub workers: usize,
    /// Retries before dead-lettering; 0 dead-letters on first failure
    pub max_retries: u32,
}

impl ConsumerConfig {
    /// Defaults: prefetch 10, 5 workers, 3 retries
    pub fn new(queue: impl Into<String>, consumer_tag: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            prefetch_count: 10,
            workers: 5,
            max_retries: 3,
        }
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> ConsumerResult<()> {
        if self.queue.is_empty() {
            return Err(ConsumerError::InvalidConfig("queue name is empty".into()));
        }
        if self.prefetch_count == 0 {
            return Err(ConsumerError::InvalidConfig(
                "prefetch_count must be at least 1".into(),
            ));
        }
        if self.workers == 0 {
            return Err(ConsumerError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A consumed message as seen by handlers
#[derive(Debug, Clone)]
pub struct Message {
    pub correlation_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Times this message has already been retried
    pub retry_count: u32,
    pub redelivered: bool,
    pub delivery_tag: u64,
}

impl Message {
    fn from_delivery(delivery: &Delivery) -> Self {
        let envelope = &delivery.envelope;
        Self {
            correlation_id: envelope.correlation_id().to_string(),
            message_id: envelope.message_id().to_string(),
            timestamp: envelope.timestamp(),
            routing_key: delivery.routing_key.clone(),
            headers: envelope.headers().clone(),
            body: envelope.body().to_vec(),
            retry_count: envelope.retry_count(),
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
        }
    }

    /// Deserialize the JSON body
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Business logic invoked for every delivery.
///
/// An `Err` drives the retry/dead-letter policy; it never stops the
/// consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, message: &Message) -> anyhow::Result<()>;
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &CancellationToken, message: &Message) -> anyhow::Result<()> {
        (self.0)(ctx.clone(), message.clone()).await
    }
}

/// Lifecycle shared by every consumer in a [`ConsumerGroup`]
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, ctx: &CancellationToken) -> ConsumerResult<()>;

    async fn stop(&self, timeout: Duration) -> ConsumerResult<()>;

    /// True while the consumer is started and still receiving deliveries
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// What happened to a delivery after its handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Acked,
    /// Republished with this retry count, original acked
    Retried(u32),
    DeadLettered,
}

struct Worker {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    /// Subscribed and the delivery stream has not ended
    live: AtomicBool,
}

/// Consumer for a single queue
pub struct MessageConsumer {
    worker: Arc<Worker>,
    state: Mutex<ConsumerState>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl MessageConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> ConsumerResult<Self> {
        config.validate()?;
        Ok(Self {
            worker: Arc::new(Worker {
                broker,
                handler,
                config,
                live: AtomicBool::new(false),
            }),
            state: Mutex::new(ConsumerState::Created),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.worker.config.queue
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.worker.config
    }

    /// False before start, after stop, and once the delivery stream has
    /// ended (workers do not resubscribe)
    pub fn is_running(&self) -> bool {
        self.worker.live.load(Ordering::Acquire)
    }

    /// Set QoS, subscribe, and launch the worker pool.
    ///
    /// Workers run until `ctx` is cancelled or [`stop`](Self::stop) is
    /// called. A consumer starts at most once.
    pub async fn start(&self, ctx: &CancellationToken) -> ConsumerResult<()> {
        let config = &self.worker.config;
        {
            let mut state = self.state.lock().await;
            if *state != ConsumerState::Created {
                return Err(ConsumerError::AlreadyStarted(config.queue.clone()));
            }
            *state = ConsumerState::Started;
        }

        let deliveries = match self.subscribe().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                *self.state.lock().await = ConsumerState::Created;
                return Err(e);
            }
        };

        self.worker.live.store(true, Ordering::Release);
        let deliveries = Arc::new(Mutex::new(deliveries));
        for worker_id in 0..config.workers {
            let worker = Arc::clone(&self.worker);
            let deliveries = Arc::clone(&deliveries);
            let ctx = ctx.clone();
            let stop = self.stop.clone();
            self.tracker
                .spawn(async move { worker.run(worker_id, deliveries, ctx, stop).await });
        }

        tracing::info!(
            queue = %config.queue,
            consumer_tag = %config.consumer_tag,
            prefetch_count = config.prefetch_count,
            workers = config.workers,
            "Consumer started"
        );
        Ok(())
    }

    async fn subscribe(&self) -> ConsumerResult<DeliveryStream> {
        let Worker { broker, config, .. } = self.worker.as_ref();

        broker
            .set_qos(config.prefetch_count)
            .await
            .map_err(|source| ConsumerError::Qos {
                queue: config.queue.clone(),
                source,
            })?;

        broker
            .consume(&config.queue, &config.consumer_tag)
            .await
            .map_err(|source| ConsumerError::Subscribe {
                queue: config.queue.clone(),
                source,
            })
    }

    /// Signal the workers to exit and wait up to `timeout` for them.
    ///
    /// In-flight handlers are never aborted; on timeout they keep running
    /// and [`ConsumerError::StopTimeout`] is returned. Only the first call
    /// has any effect.
    pub async fn stop(&self, timeout: Duration) -> ConsumerResult<()> {
        let queue = &self.worker.config.queue;
        {
            let mut state = self.state.lock().await;
            match *state {
                ConsumerState::Started => *state = ConsumerState::Stopping,
                ConsumerState::Created => {
                    *state = ConsumerState::Stopped;
                    return Ok(());
                }
                ConsumerState::Stopping | ConsumerState::Stopped => return Ok(()),
            }
        }

        tracing::info!(
            queue = %queue,
            consumer_tag = %self.worker.config.consumer_tag,
            "Stopping consumer"
        );
        self.worker.live.store(false, Ordering::Release);
        self.stop.cancel();
        self.tracker.close();

        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await;
        *self.state.lock().await = ConsumerState::Stopped;

        match drained {
            Ok(()) => {
                tracing::info!(queue = %queue, "Consumer stopped gracefully");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(queue = %queue, "Consumer stop timeout exceeded");
                Err(ConsumerError::StopTimeout {
                    queue: queue.clone(),
                    waited: timeout,
                })
            }
        }
    }
}

#[async_trait]
impl Consumer for MessageConsumer {
    fn name(&self) -> &str {
        self.queue()
    }

    async fn start(&self, ctx: &CancellationToken) -> ConsumerResult<()> {
        MessageConsumer::start(self, ctx).await
    }

    async fn stop(&self, timeout: Duration) -> ConsumerResult<()> {
        MessageConsumer::stop(self, timeout).await
    }

    fn is_running(&self) -> bool {
        MessageConsumer::is_running(self)
    }
}

impl Worker {
    async fn run(
        &self,
        worker_id: usize,
        deliveries: Arc<Mutex<DeliveryStream>>,
        ctx: CancellationToken,
        stop: CancellationToken,
    ) {
        let queue = &self.config.queue;
        tracing::debug!(worker_id, queue = %queue, "Consumer worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    self.live.store(false, Ordering::Release);
                    tracing::debug!(worker_id, queue = %queue, "Consumer worker stopped (context done)");
                    return;
                }
                _ = stop.cancelled() => {
                    tracing::debug!(worker_id, queue = %queue, "Consumer worker stopped (stop signal)");
                    return;
                }
                next = async { deliveries.lock().await.next().await } => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process(worker_id, &ctx, &stop, delivery).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(worker_id, queue = %queue, error = %e, "Delivery stream error");
                }
                None => {
                    if self.live.swap(false, Ordering::AcqRel) {
                        tracing::error!(queue = %queue, "Delivery stream ended, consumer is no longer receiving");
                    }
                    tracing::warn!(worker_id, queue = %queue, "Delivery channel closed");
                    return;
                }
            }
        }
    }

    async fn process(
        &self,
        worker_id: usize,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        delivery: Delivery,
    ) -> Disposition {
        let queue = &self.config.queue;
        let message = Message::from_delivery(&delivery);
        let tag = delivery.delivery_tag;

        let started = Instant::now();
        let result = self.handler.handle(&ctx.child_token(), &message).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let err = match result {
            Ok(()) => {
                tracing::debug!(
                    worker_id,
                    queue = %queue,
                    correlation_id = %message.correlation_id,
                    message_id = %message.message_id,
                    duration_ms,
                    retry_count = message.retry_count,
                    "Message processed successfully"
                );
                if let Err(e) = self.broker.ack(tag).await {
                    tracing::error!(queue = %queue, error = %e, "Failed to ack message");
                }
                return Disposition::Acked;
            }
            Err(err) => err,
        };

        tracing::error!(
            worker_id,
            queue = %queue,
            correlation_id = %message.correlation_id,
            message_id = %message.message_id,
            duration_ms,
            retry_count = message.retry_count,
            error = %format!("{:#}", err),
            "Message processing failed"
        );

        if message.retry_count >= self.config.max_retries {
            match self.broker.nack(tag, false).await {
                Ok(()) => tracing::warn!(
                    queue = %queue,
                    correlation_id = %message.correlation_id,
                    retry_count = message.retry_count,
                    "Message sent to dead letter queue (max retries exceeded)"
                ),
                Err(e) => tracing::error!(
                    queue = %queue,
                    error = %e,
                    "Failed to nack message (send to DLQ)"
                ),
            }
            return Disposition::DeadLettered;
        }

        let next_count = message.retry_count + 1;
        if let Err(e) = self
            .republish(ctx, stop, &delivery, message.retry_count)
            .await
        {
            tracing::error!(
                queue = %queue,
                correlation_id = %message.correlation_id,
                error = %e,
                "Failed to republish message for retry"
            );
            if let Err(e) = self.broker.nack(tag, false).await {
                tracing::error!(queue = %queue, error = %e, "Failed to nack message");
            }
            return Disposition::DeadLettered;
        }

        match self.broker.ack(tag).await {
            Ok(()) => tracing::info!(
                queue = %queue,
                correlation_id = %message.correlation_id,
                retry_count = next_count,
                max_retries = self.config.max_retries,
                "Message republished for retry"
            ),
            Err(e) => tracing::error!(
                queue = %queue,
                error = %e,
                "Failed to ack message after republish"
            ),
        }
        Disposition::Retried(next_count)
    }

    /// Wait out the retry delay, then publish a copy of the delivery to the
    /// same queue through the default exchange. Cancellation cuts the delay
    /// short but still republishes.
    async fn republish(
        &self,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        delivery: &Delivery,
        retry_count: u32,
    ) -> crate::broker::BrokerResult<()> {
        let delay = retry_delay(retry_count);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancelled() => {}
            _ = stop.cancelled() => {}
        }

        let retried = delivery.envelope.with_retry_count(retry_count + 1);
        self.broker
            .publish(ctx, "", &self.config.queue, &retried)
            .await
    }
}

/// Consumers started and stopped together
#[derive(Default)]
pub struct ConsumerGroup {
    consumers: Vec<Arc<dyn Consumer>>,
}

impl ConsumerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Names of consumers that are not receiving deliveries
    pub fn stalled(&self) -> Vec<String> {
        self.consumers
            .iter()
            .filter(|c| !c.is_running())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Start every consumer concurrently. A failing consumer is logged and
    /// does not keep the others from starting.
    pub async fn start_all(&self, ctx: &CancellationToken) -> ConsumerResult<()> {
        let results = join_all(self.consumers.iter().map(|c| c.start(ctx))).await;

        let mut failed = 0;
        for (index, (consumer, result)) in self.consumers.iter().zip(results).enumerate() {
            if let Err(e) = result {
                failed += 1;
                tracing::error!(index, consumer = %consumer.name(), error = %e, "Consumer failed to start");
            }
        }

        if failed > 0 {
            return Err(ConsumerError::GroupStart {
                failed,
                total: self.consumers.len(),
            });
        }
        tracing::info!(count = self.consumers.len(), "Consumer group started");
        Ok(())
    }

    /// Stop every consumer concurrently, each bounded by `timeout`
    pub async fn stop_all(&self, timeout: Duration) -> ConsumerResult<()> {
        tracing::info!(count = self.consumers.len(), "Stopping consumer group");
        let results = join_all(self.consumers.iter().map(|c| c.stop(timeout))).await;

        let mut failed = 0;
        for (index, (consumer, result)) in self.consumers.iter().zip(results).enumerate() {
            if let Err(e) = result {
                failed += 1;
                tracing::error!(index, consumer = %consumer.name(), error = %e, "Failed to stop consumer");
            }
        }

        if failed > 0 {
            tracing::warn!(failed, "Consumer group stop incomplete");
            return Err(ConsumerError::GroupStop {
                failed,
                total: self.consumers.len(),
            });
        }
        tracing::info!("All consumers stopped");
        Ok(())
    }
}
