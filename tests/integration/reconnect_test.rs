// tests/integration/reconnect_test.rs

//! Integration tests for automatic reconnection and subscription recovery

use super::test_helpers::{TestContext, wait_until};
use pgcluster::core::{ConnectionState, PoolError, PoolStatus, QueryOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_subscriptions_once() {
    let ctx = TestContext::new(1).await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    ctx.cluster.subscribe("jobs", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    ctx.cluster.listen(["jobs", "news"]).await.unwrap();

    assert!(ctx.server.drop_session(0));
    wait_until(|| ctx.server.live_sessions() == vec![1]).await;
    ctx.wait_idle().await;

    // One LISTEN from the caller, one batch on the replacement connection.
    assert_eq!(ctx.server.count_sent("LISTEN"), 2);
    assert_eq!(
        ctx.server.log().last().unwrap().command,
        "LISTEN \"jobs\";LISTEN \"news\""
    );
    assert_eq!(ctx.server.listening(1), vec!["jobs", "news"]);
    assert_eq!(ctx.cluster.stats().reconnects, 1);

    ctx.server.notify("jobs", "after");
    wait_until(|| received.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_changes_session_identity() {
    let ctx = TestContext::new(1).await;
    let before = ctx.cluster.connections()[0].generation;

    ctx.server.drop_session(0);
    wait_until(|| ctx.server.live_sessions() == vec![1]).await;
    ctx.wait_idle().await;

    let after = ctx.cluster.connections()[0].clone();
    assert_ne!(after.generation, before);
    assert!(!after.in_session);
    // Nothing was listened on, so nothing is re-sent.
    assert!(ctx.server.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_request_fails_then_pool_recovers() {
    let ctx = TestContext::new(1).await;

    let in_flight = ctx.cluster.query("HANG", QueryOptions::empty(), None);
    wait_until(|| ctx.server.count_sent("HANG") == 1).await;
    ctx.server.drop_session(0);
    assert_eq!(in_flight.await, Err(PoolError::TransportLost));

    // Requests submitted during the outage wait for the replacement connection.
    let cursor = ctx
        .cluster
        .query("SELECT recovered", QueryOptions::empty(), None)
        .await
        .unwrap();
    assert!(cursor.is_ok());
    assert_eq!(ctx.server.session_of("SELECT recovered"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_retries_until_the_server_returns() {
    let ctx = TestContext::new(1).await;

    ctx.server.refuse_next(3);
    ctx.server.drop_session(0);
    wait_until(|| ctx.server.live_sessions() == vec![1]).await;
    ctx.wait_idle().await;

    // One initial handshake, three refusals, one success.
    assert_eq!(ctx.server.connects(), 5);
    assert_eq!(ctx.cluster.stats().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_hook_chooses_channels() {
    let ctx = TestContext::new(1).await;
    ctx.cluster.listen(["old"]).await.unwrap();
    ctx.cluster.on_reconnect(|_, previous| {
        assert_eq!(previous, ["old".to_string()]);
        vec!["audit".to_string()]
    });

    ctx.server.drop_session(0);
    wait_until(|| ctx.server.live_sessions() == vec![1]).await;
    ctx.wait_idle().await;

    assert_eq!(ctx.server.listening(1), vec!["audit"]);
    assert_eq!(ctx.cluster.connections()[0].listening, vec!["audit"]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_interrupts_backoff() {
    let ctx = TestContext::new(1).await;

    ctx.server.refuse_next(usize::MAX);
    ctx.server.drop_session(0);
    wait_until(|| ctx.server.connects() > 2).await;

    ctx.cluster.disconnect().await;
    assert_eq!(ctx.cluster.status(), PoolStatus::Disconnected);
    assert!(ctx.cluster.connections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unlisten_while_reconnecting_is_not_resumed() {
    let ctx = TestContext::new(1).await;
    ctx.cluster.listen(["jobs"]).await.unwrap();

    ctx.server.refuse_next(3);
    ctx.server.drop_session(0);
    wait_until(|| ctx.cluster.connections()[0].state != ConnectionState::Idle).await;

    ctx.cluster.unlisten(["jobs"]).await.unwrap();
    assert!(ctx.cluster.connections()[0].listening.is_empty());

    wait_until(|| ctx.server.live_sessions() == vec![1]).await;
    ctx.wait_idle().await;

    assert!(ctx.server.listening(1).is_empty());
    assert!(ctx.cluster.connections()[0].listening.is_empty());
    assert_eq!(ctx.server.sent(), vec!["LISTEN \"jobs\"".to_string()]);
}
