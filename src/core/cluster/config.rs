// src/core/cluster/config.rs

//! Defines the pool's tuning options.

use crate::core::cache::CacheConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Holds all configuration settings of a `Cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The shared deadline for all handshakes performed by `connect()`.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            cache: CacheConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Backoff bounds for re-establishing a lost connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    /// The delay doubles after every failed attempt, up to this ceiling.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl ReconnectConfig {
    /// The delay that follows `delay` after another failed attempt.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}
