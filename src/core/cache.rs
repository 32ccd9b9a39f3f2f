// src/core/cache.rs

//! The tiered query result cache.
//!
//! Entries are keyed by a SHA-256 of the query text plus a tier suffix, so the same text
//! cached under two tiers lives in two independent entries. There is no background timer:
//! expired entries are evicted when they are looked up, and a full sweep runs at most
//! once per `cleanup_interval`, piggybacking on `store`.

use crate::core::cursor::Cursor;
use crate::core::request::CacheTier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Durations for each cache tier and the minimum spacing between sweeps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    #[serde(with = "humantime_serde", default = "default_short_ttl")]
    pub short_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_mid_ttl")]
    pub mid_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_long_ttl")]
    pub long_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
}

fn default_short_ttl() -> Duration {
    Duration::from_secs(5)
}
fn default_mid_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_long_ttl() -> Duration {
    Duration::from_secs(600)
}
fn default_cleanup_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            short_ttl: default_short_ttl(),
            mid_ttl: default_mid_ttl(),
            long_ttl: default_long_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Short => self.short_ttl,
            CacheTier::Mid => self.mid_ttl,
            CacheTier::Long => self.long_ttl,
        }
    }
}

/// Computes the cache key for a query text under a tier.
pub fn cache_key(query: &str, tier: CacheTier) -> String {
    let digest = Sha256::digest(query.as_bytes());
    format!("{}:{}", hex::encode(digest), tier.suffix())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    expiry: Instant,
    value: Cursor,
}

/// The cache map itself. Not synchronized: it lives inside the pool's lock.
#[derive(Debug)]
pub struct QueryCache {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    last_sweep: Instant,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns a copy of the live entry for `key`, evicting it if it has expired.
    pub fn lookup(&mut self, key: &str, now: Instant) -> Option<Cursor> {
        match self.entries.get(key) {
            Some(entry) if now < entry.expiry => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                debug!("Evicted expired cache entry {}", key);
                None
            }
            None => None,
        }
    }

    /// Stores `value` under `key` for the tier's duration, then sweeps if one is due.
    pub fn store(&mut self, key: String, value: Cursor, tier: CacheTier, now: Instant) {
        let expiry = now + self.config.ttl(tier);
        self.entries.insert(key, CacheEntry { expiry, value });

        if now.duration_since(self.last_sweep) >= self.config.cleanup_interval {
            self.sweep(now);
        }
    }

    /// Removes every expired entry. Returns the number of entries removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expiry);
        self.last_sweep = now;
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Cache sweep removed {} expired entries.", removed);
        }
        removed
    }

    /// The expiry of an entry, expired or not.
    pub fn expiry_of(&self, key: &str) -> Option<Instant> {
        self.entries.get(key).map(|e| e.expiry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
