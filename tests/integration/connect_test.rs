// tests/integration/connect_test.rs

//! Integration tests for pool startup and teardown

use super::test_helpers::{TestContext, init_tracing, test_address, test_config, wait_until};
use pgcluster::core::transport::MockConnector;
use pgcluster::core::{Cluster, ConnectionState, PoolError, PoolStatus, QueryOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_connect_opens_every_slot() {
    let ctx = TestContext::new(3).await;

    assert_eq!(ctx.cluster.status(), PoolStatus::Connected);
    assert_eq!(ctx.server.connects(), 3);
    let connections = ctx.cluster.connections();
    assert_eq!(connections.len(), 3);
    for (id, info) in connections.iter().enumerate() {
        assert_eq!(info.id, id);
        assert_eq!(info.state, ConnectionState::Idle);
        assert!(!info.in_session);
    }
}

#[tokio::test]
async fn test_partial_failure_tears_the_pool_down() {
    init_tracing();
    let server = MockConnector::new();
    server.refuse_next(1);
    let cluster = Cluster::new(server.clone(), test_config());

    let result = cluster.connect(test_address(), 3).await;
    assert!(matches!(result, Err(PoolError::Connect(_))));
    assert_eq!(cluster.status(), PoolStatus::Disconnected);
    assert!(cluster.connections().is_empty());
    // The handshakes that did succeed were closed again.
    assert!(server.live_sessions().is_empty());

    let query = cluster.query("SELECT 1", QueryOptions::empty(), None).await;
    assert_eq!(query, Err(PoolError::NotConnected));

    // A later attempt starts from scratch.
    cluster.connect(test_address(), 2).await.unwrap();
    assert_eq!(cluster.connections().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_deadline_is_shared() {
    init_tracing();
    let server = MockConnector::new();
    server.set_connect_delay(Duration::from_secs(5));
    let cluster = Cluster::new(server.clone(), test_config());

    let result = cluster.connect(test_address(), 2).await;
    assert!(matches!(result, Err(PoolError::Connect(_))));
    assert_eq!(cluster.status(), PoolStatus::Disconnected);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let ctx = TestContext::new(1).await;

    let result = ctx.cluster.connect(test_address(), 1).await;
    assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
    assert_eq!(ctx.server.connects(), 1);
}

#[tokio::test]
async fn test_zero_pool_size_is_rejected() {
    let cluster = Cluster::new(MockConnector::new(), test_config());
    let result = cluster.connect(test_address(), 0).await;
    assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_subscriptions_survive_disconnect() {
    let ctx = TestContext::new(1).await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    ctx.cluster.subscribe("jobs", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    ctx.cluster.disconnect().await;
    assert_eq!(ctx.cluster.status(), PoolStatus::Disconnected);
    // Disconnecting twice is harmless.
    ctx.cluster.disconnect().await;

    ctx.cluster.connect(test_address(), 1).await.unwrap();
    ctx.cluster.listen(["jobs"]).await.unwrap();
    ctx.server.notify("jobs", "again");
    wait_until(|| received.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_aborts_it() {
    init_tracing();
    let server = MockConnector::new();
    server.set_connect_delay(Duration::from_millis(100));
    let cluster = Cluster::new(server.clone(), test_config());

    let connecting = {
        let cluster = cluster.clone();
        tokio::spawn(async move { cluster.connect(test_address(), 2).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cluster.disconnect().await;

    let result = connecting.await.unwrap();
    assert_eq!(result, Err(PoolError::Disconnected));
    assert_eq!(cluster.status(), PoolStatus::Disconnected);
    assert!(cluster.connections().is_empty());
    // The handshakes that finished late were closed, not leaked.
    assert!(server.live_sessions().is_empty());

    cluster.connect(test_address(), 1).await.unwrap();
    assert_eq!(cluster.status(), PoolStatus::Connected);
}
