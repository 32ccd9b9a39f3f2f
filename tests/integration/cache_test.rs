// tests/integration/cache_test.rs

//! Integration tests for the tiered result cache

use super::test_helpers::TestContext;
use pgcluster::core::{PoolError, QueryOptions};
use std::time::Duration;

#[tokio::test]
async fn test_cache_hit_does_no_io() {
    let ctx = TestContext::new(2).await;

    let first = ctx
        .cluster
        .query("SELECT cached", QueryOptions::CACHE_MID, None)
        .await
        .unwrap();
    let second = ctx
        .cluster
        .query("SELECT cached", QueryOptions::CACHE_MID, None)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(ctx.server.count_sent("SELECT cached"), 1);

    let stats = ctx.cluster.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_entries, 1);
}

#[tokio::test]
async fn test_uncached_queries_always_reach_the_server() {
    let ctx = TestContext::new(1).await;

    for _ in 0..3 {
        ctx.cluster
            .query("SELECT plain", QueryOptions::empty(), None)
            .await
            .unwrap();
    }
    assert_eq!(ctx.server.count_sent("SELECT plain"), 3);
    assert_eq!(ctx.cluster.stats().cache_entries, 0);
}

#[tokio::test]
async fn test_tiers_are_isolated() {
    let ctx = TestContext::new(1).await;

    for tier in [QueryOptions::CACHE_SHORT, QueryOptions::CACHE_LONG] {
        ctx.cluster.query("SELECT tiered", tier, None).await.unwrap();
    }
    // Same text, different tier: two independent entries, two round trips.
    assert_eq!(ctx.server.count_sent("SELECT tiered"), 2);
    assert_eq!(ctx.cluster.stats().cache_entries, 2);

    for tier in [QueryOptions::CACHE_SHORT, QueryOptions::CACHE_LONG] {
        ctx.cluster.query("SELECT tiered", tier, None).await.unwrap();
    }
    assert_eq!(ctx.server.count_sent("SELECT tiered"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_short_tier_expires() {
    let ctx = TestContext::new(1).await;

    ctx.cluster
        .query("SELECT brief", QueryOptions::CACHE_SHORT, None)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1500)).await;
    ctx.cluster
        .query("SELECT brief", QueryOptions::CACHE_SHORT, None)
        .await
        .unwrap();

    assert_eq!(ctx.server.count_sent("SELECT brief"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_cache_evicts_expired_entries() {
    let ctx = TestContext::new(1).await;

    ctx.cluster
        .query("SELECT a", QueryOptions::CACHE_SHORT, None)
        .await
        .unwrap();
    ctx.cluster
        .query("SELECT b", QueryOptions::CACHE_LONG, None)
        .await
        .unwrap();
    assert_eq!(ctx.cluster.sweep_cache(), 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(ctx.cluster.sweep_cache(), 1);
    assert_eq!(ctx.cluster.stats().cache_entries, 1);
}

#[tokio::test]
async fn test_server_errors_are_not_cached() {
    let ctx = TestContext::new(1).await;

    for _ in 0..2 {
        let cursor = ctx
            .cluster
            .query("FAIL on purpose", QueryOptions::CACHE_LONG, None)
            .await
            .unwrap();
        assert!(cursor.error().is_some());
    }
    assert_eq!(ctx.server.count_sent("FAIL on purpose"), 2);
}

#[tokio::test]
async fn test_conflicting_tiers_are_rejected() {
    let ctx = TestContext::new(1).await;

    let result = ctx
        .cluster
        .query(
            "SELECT 1",
            QueryOptions::CACHE_SHORT | QueryOptions::CACHE_MID,
            None,
        )
        .await;
    assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
    assert!(ctx.server.sent().is_empty());
}

#[tokio::test]
async fn test_reuse_arguments_keeps_command_text() {
    let ctx = TestContext::new(1).await;

    let cursor = ctx
        .cluster
        .query(
            "SELECT again",
            QueryOptions::REUSE_ARGUMENTS | QueryOptions::CACHE_MID,
            None,
        )
        .await
        .unwrap();
    assert_eq!(cursor.command(), Some("SELECT again"));

    // The cached copy carries the text as well.
    let cached = ctx
        .cluster
        .query(
            "SELECT again",
            QueryOptions::REUSE_ARGUMENTS | QueryOptions::CACHE_MID,
            None,
        )
        .await
        .unwrap();
    assert_eq!(cached.command(), Some("SELECT again"));

    let plain = ctx
        .cluster
        .query("SELECT again", QueryOptions::empty(), None)
        .await
        .unwrap();
    assert_eq!(plain.command(), None);
}
