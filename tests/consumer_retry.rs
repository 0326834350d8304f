//! Retry and dead-letter scenarios against the in-memory broker

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ridehail::broker::topology::{DEAD_LETTERS, RIDE_REQUESTS};
use ridehail::broker::{Broker, DeliveryOutcome, HeaderValue, RETRY_COUNT_HEADER};
use ridehail::mq::{handler_fn, ConsumerConfig, MessageConsumer, RideEventPublisher};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{topology_broker, wait_until};

fn count_acks(outcomes: &[DeliveryOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, DeliveryOutcome::Ack { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_without_dead_lettering() {
    let broker = topology_broker().await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&attempts);
    let handler = handler_fn(move |_ctx, message| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            if message.retry_count < 2 {
                anyhow::bail!("driver lookup unavailable");
            }
            Ok(())
        }
    });

    let consumer = MessageConsumer::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        ConsumerConfig::new(RIDE_REQUESTS, "matcher").max_retries(2),
        Arc::new(handler),
    )
    .unwrap();
    let ctx = CancellationToken::new();
    consumer.start(&ctx).await.unwrap();

    let rides = RideEventPublisher::new(Arc::clone(&broker) as Arc<dyn Broker>);
    for i in 0..5 {
        rides
            .publish_ride_request(&ctx, "ECONOMY", &json!({ "ride_id": format!("ride-{i}") }))
            .await
            .unwrap();
    }

    // each ride: original acked after retry 1, retry 1 acked after retry 2,
    // retry 2 acked on success
    let memory = &broker;
    wait_until(Duration::from_secs(30), move || async move {
        count_acks(&memory.outcomes().await) == 15
    })
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 15);
    assert_eq!(broker.queue_depth(DEAD_LETTERS).await, 0);

    let mut retry_counts: Vec<u32> = broker
        .published()
        .await
        .iter()
        .filter(|record| record.exchange.is_empty())
        .map(|record| record.envelope.retry_count())
        .collect();
    retry_counts.sort_unstable();
    assert_eq!(retry_counts, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);

    consumer.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_dead_lettered_after_max_retries() {
    let broker = topology_broker().await;

    let handler = handler_fn(|_ctx, _message| async {
        Err::<(), _>(anyhow::anyhow!("fare service rejected ride"))
    });
    let consumer = MessageConsumer::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        ConsumerConfig::new(RIDE_REQUESTS, "matcher").max_retries(3),
        Arc::new(handler),
    )
    .unwrap();
    let ctx = CancellationToken::new();
    consumer.start(&ctx).await.unwrap();

    RideEventPublisher::new(Arc::clone(&broker) as Arc<dyn Broker>)
        .publish_ride_request(&ctx, "PREMIUM", &json!({ "ride_id": "ride-dlq" }))
        .await
        .unwrap();

    let memory = &broker;
    wait_until(Duration::from_secs(30), move || async move {
        memory.queue_depth(DEAD_LETTERS).await == 1
    })
    .await;

    let outcomes = broker.outcomes().await;
    assert_eq!(count_acks(&outcomes), 3);
    assert!(outcomes.iter().any(|o| matches!(
        o,
        DeliveryOutcome::Nack { requeue: false, .. }
    )));

    let republished = broker
        .published()
        .await
        .iter()
        .filter(|record| record.exchange.is_empty())
        .count();
    assert_eq!(republished, 3);

    let dead = broker.drain_queue(DEAD_LETTERS).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count(), 3);
    assert_eq!(
        dead[0].headers().get(RETRY_COUNT_HEADER),
        Some(&HeaderValue::Int(3))
    );
    assert_eq!(
        dead[0].headers().get("x-first-death-queue"),
        Some(&HeaderValue::Str(RIDE_REQUESTS.to_string()))
    );
    let body: serde_json::Value = serde_json::from_slice(dead[0].body()).unwrap();
    assert_eq!(body["ride_id"], "ride-dlq");

    consumer.stop(Duration::from_secs(1)).await.unwrap();
}
