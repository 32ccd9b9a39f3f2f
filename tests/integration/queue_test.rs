// tests/integration/queue_test.rs

//! Integration tests for request queueing and dispatch

use super::test_helpers::{TestContext, wait_until};
use futures::future::join_all;
use pgcluster::core::{PoolError, QueryOptions};
use tokio_test::{assert_pending, task};

#[tokio::test]
async fn test_fifo_with_single_connection() {
    let ctx = TestContext::new(1).await;

    let pending: Vec<_> = (0..5)
        .map(|i| {
            ctx.cluster
                .query(format!("SELECT {i}"), QueryOptions::empty(), None)
        })
        .collect();
    let cursors = join_all(pending).await;

    let sent = ctx.server.sent();
    let expected: Vec<String> = (0..5).map(|i| format!("SELECT {i}")).collect();
    assert_eq!(sent, expected);

    for (i, cursor) in cursors.into_iter().enumerate() {
        let cursor = cursor.unwrap();
        assert_eq!(cursor.first().unwrap().rows[0][0].as_deref(), Some(i.to_string().as_str()));
    }
}

#[tokio::test]
async fn test_results_keep_server_order() {
    let ctx = TestContext::new(1).await;

    let cursor = ctx
        .cluster
        .query("SELECT one; CREATE TABLE t; SELECT two", QueryOptions::empty(), None)
        .await
        .unwrap();

    let tags: Vec<&str> = cursor.results().iter().map(|r| r.tag.as_str()).collect();
    assert_eq!(tags, vec!["SELECT 1", "CREATE", "SELECT 1"]);
    let values: Vec<_> = cursor.rows().map(|r| r[0].clone()).collect();
    assert_eq!(values, vec![Some("one".to_string()), Some("two".to_string())]);
}

#[tokio::test]
async fn test_server_error_resolves_with_cursor() {
    let ctx = TestContext::new(1).await;

    let cursor = ctx
        .cluster
        .query("SELECT before; FAIL boom; SELECT after", QueryOptions::empty(), None)
        .await
        .unwrap();
    let error = cursor.error().unwrap();
    assert_eq!(error.severity, "ERROR");
    assert!(error.message.contains("FAIL boom"));
    assert_eq!(cursor.len(), 1);

    // The connection stays usable.
    let next = ctx
        .cluster
        .query("SELECT fine", QueryOptions::empty(), None)
        .await
        .unwrap();
    assert!(next.is_ok());
}

#[tokio::test]
async fn test_queued_request_waits_for_busy_connection() {
    let ctx = TestContext::new(1).await;

    let _stuck = ctx.cluster.query("HANG", QueryOptions::empty(), None);
    wait_until(|| ctx.server.count_sent("HANG") == 1).await;

    let mut waiting = task::spawn(ctx.cluster.query("SELECT queued", QueryOptions::empty(), None));
    assert_pending!(waiting.poll());
    assert_eq!(ctx.server.count_sent("SELECT queued"), 0);
    assert_eq!(ctx.cluster.stats().queued, 1);
}

#[tokio::test]
async fn test_second_connection_serves_while_first_is_busy() {
    let ctx = TestContext::new(2).await;

    let _stuck = ctx.cluster.query("HANG", QueryOptions::empty(), None);
    wait_until(|| ctx.server.count_sent("HANG") == 1).await;

    let cursor = ctx
        .cluster
        .query("SELECT free", QueryOptions::empty(), None)
        .await
        .unwrap();
    assert!(cursor.is_ok());
    assert_ne!(
        ctx.server.session_of("HANG"),
        ctx.server.session_of("SELECT free")
    );
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let ctx = TestContext::new(1).await;

    let result = ctx.cluster.query("   ", QueryOptions::empty(), None).await;
    assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
    assert!(ctx.server.sent().is_empty());
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_requests() {
    let ctx = TestContext::new(1).await;

    let in_flight = ctx.cluster.query("HANG", QueryOptions::empty(), None);
    wait_until(|| ctx.server.count_sent("HANG") == 1).await;
    let queued = ctx.cluster.query("SELECT never", QueryOptions::empty(), None);

    ctx.cluster.disconnect().await;

    assert_eq!(in_flight.await, Err(PoolError::Disconnected));
    assert_eq!(queued.await, Err(PoolError::Disconnected));
    assert_eq!(ctx.server.count_sent("SELECT never"), 0);
    assert!(ctx.server.live_sessions().is_empty());
}

#[tokio::test]
async fn test_stats_count_completed_requests() {
    let ctx = TestContext::new(2).await;

    let pending: Vec<_> = (0..4)
        .map(|i| ctx.cluster.query(format!("SELECT {i}"), QueryOptions::empty(), None))
        .collect();
    for result in join_all(pending).await {
        result.unwrap();
    }

    let stats = ctx.cluster.stats();
    assert_eq!(stats.queries, 4);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.connections.len(), 2);
}

#[tokio::test]
async fn test_nul_byte_is_rejected_before_queueing() {
    let ctx = TestContext::new(1).await;

    let result = ctx
        .cluster
        .query("SELECT 'a\0b'", QueryOptions::empty(), None)
        .await;
    assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
    assert!(ctx.server.sent().is_empty());
    assert_eq!(ctx.cluster.stats().queries, 0);
}
