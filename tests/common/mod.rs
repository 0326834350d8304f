//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ridehail::broker::{topology, MemoryBroker};

/// In-memory broker with the full deployment topology declared
pub async fn topology_broker() -> Arc<MemoryBroker> {
    let broker = Arc::new(MemoryBroker::new());
    topology::declare_topology(broker.as_ref())
        .await
        .expect("declare topology");
    broker
}

/// Poll `condition` every 10ms until it holds; panics after `limit`
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(limit, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within {:?}", limit);
}
