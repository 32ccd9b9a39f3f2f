// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use pgcluster::core::cache::CacheConfig;
use pgcluster::core::cluster::{ClusterConfig, ReconnectConfig};
use pgcluster::core::transport::MockConnector;
use pgcluster::core::{Address, Cluster, ConnectionState};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// TestContext provides a connected pool backed by the in-memory mock server
pub struct TestContext {
    pub cluster: Cluster,
    pub server: MockConnector,
}

impl TestContext {
    /// Creates a connected pool of `pool_size` connections with test-friendly timings
    pub async fn new(pool_size: usize) -> Self {
        Self::with_config(test_config(), pool_size).await
    }

    pub async fn with_config(config: ClusterConfig, pool_size: usize) -> Self {
        init_tracing();
        let server = MockConnector::new();
        let cluster = Cluster::new(server.clone(), config);
        cluster
            .connect(test_address(), pool_size)
            .await
            .expect("mock pool should connect");
        Self { cluster, server }
    }

    /// Waits until every connection is idle again, e.g. after a reconnection
    pub async fn wait_idle(&self) {
        wait_until(|| {
            self.cluster
                .connections()
                .iter()
                .all(|c| c.state == ConnectionState::Idle)
        })
        .await;
    }
}

pub fn init_tracing() {
    // Initialize tracing (ignore error if already initialized)
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn test_address() -> Address {
    Address::new()
        .with("host", "mock")
        .with("user", "tester")
        .with("dbname", "tests")
}

pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        connect_timeout: Duration::from_secs(1),
        cache: CacheConfig {
            short_ttl: Duration::from_secs(1),
            mid_ttl: Duration::from_secs(10),
            long_ttl: Duration::from_secs(100),
            cleanup_interval: Duration::from_secs(1),
        },
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
        },
    }
}

/// Polls `condition` until it holds, yielding to the runtime in between. Panics after
/// a generous number of rounds so a broken test fails instead of hanging.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not met in time");
}
