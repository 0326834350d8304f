//! In-process broker
//!
//! Implements [`Broker`] entirely in memory: exchanges (direct, topic,
//! fanout), bindings, durable queues with round-robin consumers, delivery
//! tags, ack/nack/reject and dead-lettering through a queue's
//! dead-letter exchange. The most recent publishes and settlements are
//! recorded so tests can assert on what went over the "wire"; the record
//! logs keep at most [`DEFAULT_RECORD_LIMIT`] entries each, oldest dropped
//! first.
//!
//! Prefetch is recorded but not enforced.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::envelope::{Delivery, Envelope, HeaderValue};
use super::error::{BrokerError, BrokerResult};
use super::{Broker, DeliveryStream, ExchangeKind, QueueSpec};

/// Returns true if an AMQP topic binding `pattern` matches `routing_key`.
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Entries kept in each record log unless overridden
pub const DEFAULT_RECORD_LIMIT: usize = 10_000;

/// A message accepted by `publish`
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack {
        queue: String,
        message_id: String,
    },
    Nack {
        queue: String,
        message_id: String,
        requeue: bool,
    },
    Reject {
        queue: String,
        message_id: String,
        requeue: bool,
    },
}

#[derive(Debug, Clone)]
struct Pending {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
    redelivered: bool,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Pending>,
    consumers: Vec<mpsc::UnboundedSender<BrokerResult<Delivery>>>,
    next_consumer: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct Unacked {
    queue: String,
    pending: Pending,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    published: VecDeque<PublishRecord>,
    outcomes: VecDeque<DeliveryOutcome>,
    record_limit: usize,
    prefetch: Option<u16>,
    failing_publishes: usize,
}

fn push_bounded<T>(log: &mut VecDeque<T>, limit: usize, entry: T) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back(entry);
}

impl State {
    fn record_outcome(&mut self, outcome: DeliveryOutcome) {
        push_bounded(&mut self.outcomes, self.record_limit, outcome);
    }

    /// Queues a message published to `exchange` with `routing_key` lands in
    fn route(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange {}", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => routing_key_matches(&binding.routing_key, routing_key),
                ExchangeKind::Headers => false,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, pending: Pending) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        while !state.consumers.is_empty() {
            let index = state.next_consumer % state.consumers.len();
            let tag = self.next_tag + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                redelivered: pending.redelivered,
                exchange: pending.exchange.clone(),
                routing_key: pending.routing_key.clone(),
                envelope: pending.envelope.clone(),
            };

            if state.consumers[index].send(Ok(delivery)).is_ok() {
                state.next_consumer = index + 1;
                self.next_tag = tag;
                self.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        pending,
                    },
                );
                return;
            }

            // consumer stream was dropped
            state.consumers.remove(index);
        }

        state.ready.push_back(pending);
    }

    fn dead_letter(&mut self, queue: &str, pending: Pending) {
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter_exchange.clone());

        let Some(dlx) = dlx else {
            tracing::debug!(queue = %queue, "Rejected message dropped (no dead-letter exchange)");
            return;
        };

        let envelope = Envelope::builder(pending.envelope.body().to_vec())
            .correlation_id(pending.envelope.correlation_id())
            .message_id(pending.envelope.message_id())
            .timestamp(pending.envelope.timestamp())
            .content_type(pending.envelope.content_type())
            .delivery_mode(pending.envelope.delivery_mode())
            .headers(pending.envelope.headers().clone())
            .header("x-first-death-queue", HeaderValue::Str(queue.to_string()))
            .header("x-first-death-reason", HeaderValue::Str("rejected".into()))
            .build();

        match self.route(&dlx, &pending.routing_key) {
            Ok(targets) => {
                for target in targets {
                    self.enqueue(
                        &target,
                        Pending {
                            exchange: dlx.clone(),
                            routing_key: pending.routing_key.clone(),
                            envelope: envelope.clone(),
                            redelivered: false,
                        },
                    );
                }
            }
            Err(e) => tracing::warn!(queue = %queue, error = %e, "Dead-letter routing failed"),
        }
    }

    fn settle(&mut self, tag: u64) -> BrokerResult<Unacked> {
        self.unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }

    fn negative(&mut self, tag: u64, requeue: bool, reject: bool) -> BrokerResult<()> {
        let Unacked { queue, mut pending } = self.settle(tag)?;
        let message_id = pending.envelope.message_id().to_string();
        self.record_outcome(if reject {
            DeliveryOutcome::Reject {
                queue: queue.clone(),
                message_id,
                requeue,
            }
        } else {
            DeliveryOutcome::Nack {
                queue: queue.clone(),
                message_id,
                requeue,
            }
        });

        if requeue {
            pending.redelivered = true;
            self.enqueue(&queue, pending);
        } else {
            self.dead_letter(&queue, pending);
        }
        Ok(())
    }
}

/// In-memory [`Broker`] implementation
pub struct MemoryBroker {
    state: Mutex<State>,
    connected: watch::Sender<bool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_record_limit(DEFAULT_RECORD_LIMIT)
    }

    /// Keep at most `limit` publish and settlement records each
    pub fn with_record_limit(limit: usize) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            state: Mutex::new(State {
                record_limit: limit,
                ..State::default()
            }),
            connected,
        }
    }

    /// Simulate losing (`false`) or regaining (`true`) the connection.
    /// Publishes wait while disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    /// End every consumer stream on `queue`, as a closed channel would.
    /// Unacked deliveries stay unacked.
    pub async fn cancel_consumers(&self, queue: &str) {
        if let Some(q) = self.state.lock().await.queues.get_mut(queue) {
            q.consumers.clear();
        }
    }

    /// Make the next `count` publish calls fail with a channel error
    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.failing_publishes = count;
    }

    /// Messages waiting in `queue` with no consumer to take them
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Remove and return every waiting message in `queue`
    pub async fn drain_queue(&self, queue: &str) -> Vec<Envelope> {
        let mut state = self.state.lock().await;
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|p| p.envelope).collect())
            .unwrap_or_default()
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Recorded publishes, oldest first
    pub async fn published(&self) -> Vec<PublishRecord> {
        self.state.lock().await.published.iter().cloned().collect()
    }

    /// Recorded settlements, oldest first
    pub async fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.state.lock().await.outcomes.iter().cloned().collect()
    }

    pub async fn prefetch(&self) -> Option<u16> {
        self.state.lock().await.prefetch
    }

    pub async fn has_exchange(&self, name: &str) -> Option<ExchangeKind> {
        self.state.lock().await.exchanges.get(name).map(|e| e.kind)
    }

    pub async fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.spec.clone())
    }

    async fn wait_connected(&self, cancel: &CancellationToken) -> BrokerResult<()> {
        let mut rx = self.connected.subscribe();
        if *rx.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            biased;
            res = rx.wait_for(|connected| *connected) => res.map(|_| ()).map_err(|_| BrokerError::Closed),
            _ = cancel.cancelled() => Err(BrokerError::NotReady),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        if name.is_empty() || name.starts_with("amq.") {
            return Err(BrokerError::declaration(
                format!("exchange {:?}", name),
                "reserved exchange name",
            ));
        }

        let mut state = self.state.lock().await;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::declaration(
                    format!("exchange {}", name),
                    format!(
                        "inequivalent arg: declared as {} (durable={}), requested {} (durable={})",
                        existing.kind, existing.durable, kind, durable
                    ),
                ))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeState { kind, durable });
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(BrokerError::declaration(
                format!("queue {}", spec.name),
                "inequivalent arguments for existing queue",
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue {}", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange {}", exchange)));
        }

        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BrokerResult<()> {
        self.wait_connected(cancel).await?;

        let mut state = self.state.lock().await;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Channel("simulated publish failure".into()));
        }

        let targets = state.route(exchange, routing_key)?;
        let limit = state.record_limit;
        push_bounded(
            &mut state.published,
            limit,
            PublishRecord {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
            },
        );

        if targets.is_empty() {
            tracing::debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable");
        }
        for target in targets {
            state.enqueue(
                &target,
                Pending {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    envelope: envelope.clone(),
                    redelivered: false,
                },
            );
        }
        Ok(())
    }

    async fn set_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        self.state.lock().await.prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let mut state = self.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        let backlog: Vec<Pending> = match state.queues.get_mut(queue) {
            Some(q) => {
                q.consumers.push(tx);
                q.ready.drain(..).collect()
            }
            None => return Err(BrokerError::NotFound(format!("queue {}", queue))),
        };
        for pending in backlog {
            state.enqueue(queue, pending);
        }

        tracing::debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        let Unacked { queue, pending } = state.settle(delivery_tag)?;
        state.record_outcome(DeliveryOutcome::Ack {
            queue,
            message_id: pending.envelope.message_id().to_string(),
        });
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.state.lock().await.negative(delivery_tag, requeue, false)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.state.lock().await.negative(delivery_tag, requeue, true)
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker_with_dlq() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange("work", ExchangeKind::Topic, true)
            .await
            .unwrap();
        broker
            .declare_exchange("dlx", ExchangeKind::Topic, true)
            .await
            .unwrap();
        broker
            .declare_queue(&QueueSpec::durable("jobs").dead_letter_to("dlx"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueSpec::durable("dead"))
            .await
            .unwrap();
        broker.bind("jobs", "work", "job.*").await.unwrap();
        broker.bind("dead", "dlx", "#").await.unwrap();
        broker
    }

    fn envelope(body: &str) -> Envelope {
        Envelope::builder(body.as_bytes().to_vec()).build()
    }

    #[test]
    fn test_topic_matching() {
        assert!(routing_key_matches("ride.request.*", "ride.request.economy"));
        assert!(!routing_key_matches("ride.request.*", "ride.request"));
        assert!(!routing_key_matches("ride.request.*", "ride.request.economy.x"));
        assert!(routing_key_matches("#", "anything.at.all"));
        assert!(routing_key_matches("#", ""));
        assert!(routing_key_matches("ride.#", "ride"));
        assert!(routing_key_matches("ride.#.done", "ride.a.b.done"));
        assert!(routing_key_matches("*.status.*", "driver.status.d1"));
        assert!(!routing_key_matches("driver.status.*", "ride.status.s1"));
    }

    #[tokio::test]
    async fn test_redeclare_is_idempotent_and_conflicts_fail() {
        let broker = broker_with_dlq().await;

        assert!(broker
            .declare_exchange("work", ExchangeKind::Topic, true)
            .await
            .is_ok());

        let err = broker
            .declare_exchange("work", ExchangeKind::Fanout, true)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Declaration { .. }));

        let err = broker
            .declare_queue(&QueueSpec::durable("jobs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Declaration { .. }));
    }

    #[tokio::test]
    async fn test_bind_requires_both_ends() {
        let broker = broker_with_dlq().await;
        assert!(matches!(
            broker.bind("missing", "work", "#").await,
            Err(BrokerError::NotFound(_))
        ));
        assert!(matches!(
            broker.bind("jobs", "missing", "#").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_buffers_until_consumer() {
        let broker = broker_with_dlq().await;
        let cancel = CancellationToken::new();

        broker
            .publish(&cancel, "work", "job.a", &envelope("1"))
            .await
            .unwrap();
        broker
            .publish(&cancel, "work", "other.a", &envelope("2"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("jobs").await, 1);

        let mut stream = broker.consume("jobs", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.body(), b"1");
        assert_eq!(delivery.routing_key, "job.a");
        assert_eq!(broker.queue_depth("jobs").await, 0);
        assert_eq!(broker.unacked_count().await, 1);

        broker.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count().await, 0);
        assert!(matches!(
            broker.ack(delivery.delivery_tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn test_record_logs_keep_only_the_latest_entries() {
        let broker = MemoryBroker::with_record_limit(3);
        broker
            .declare_queue(&QueueSpec::durable("jobs"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        for i in 0..5 {
            broker
                .publish(&cancel, "", "jobs", &envelope(&i.to_string()))
                .await
                .unwrap();
        }
        let bodies: Vec<Vec<u8>> = broker
            .published()
            .await
            .iter()
            .map(|r| r.envelope.body().to_vec())
            .collect();
        assert_eq!(bodies, vec![b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);

        let mut stream = broker.consume("jobs", "c1").await.unwrap();
        for _ in 0..5 {
            let delivery = stream.next().await.unwrap().unwrap();
            broker.ack(delivery.delivery_tag).await.unwrap();
        }
        assert_eq!(broker.outcomes().await.len(), 3);
        assert_eq!(broker.queue_depth("jobs").await, 0);
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = broker_with_dlq().await;
        broker
            .publish(&CancellationToken::new(), "", "jobs", &envelope("direct"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("jobs").await, 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = broker_with_dlq().await;
        let mut stream = broker.consume("jobs", "c1").await.unwrap();

        broker
            .publish(&CancellationToken::new(), "work", "job.x", &envelope("bad"))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.nack(delivery.delivery_tag, false).await.unwrap();

        let dead = broker.drain_queue("dead").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body(), b"bad");
        assert_eq!(dead[0].message_id(), delivery.envelope.message_id());
        assert_eq!(
            dead[0].headers().get("x-first-death-queue"),
            Some(&HeaderValue::Str("jobs".into()))
        );
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = broker_with_dlq().await;
        let mut stream = broker.consume("jobs", "c1").await.unwrap();

        broker
            .publish(&CancellationToken::new(), "work", "job.x", &envelope("again"))
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        broker.reject(first.delivery_tag, true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_ne!(first.delivery_tag, second.delivery_tag);
        assert_eq!(broker.queue_depth("dead").await, 0);
    }

    #[tokio::test]
    async fn test_publish_waits_for_connection() {
        let broker = broker_with_dlq().await;
        broker.set_connected(false);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = broker
            .publish(&cancel, "work", "job.a", &envelope("x"))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NotReady);

        let broker = std::sync::Arc::new(broker);
        let pending = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .publish(&CancellationToken::new(), "work", "job.a", &envelope("y"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        broker.set_connected(true);
        pending.await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("jobs").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let err = broker
            .publish(&CancellationToken::new(), "nope", "k", &envelope("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }
}
