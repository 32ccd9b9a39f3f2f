// src/core/cluster/stats.rs

//! Lock-free counters describing pool activity.

use crate::core::connection::ConnectionInfo;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub queries: AtomicU64,
    pub completed: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub reconnects: AtomicU64,
    pub notifications: AtomicU64,
}

impl Counters {
    /// Atomically increments the counter for submitted requests.
    pub fn increment_queries(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_notifications(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot returned by `Cluster::stats()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    /// Requests accepted by `query()`, cache hits excluded.
    pub queries: u64,
    /// Requests that ran to completion on a connection.
    pub completed: u64,
    pub cache_hits: u64,
    /// Lookups for a cacheable query that found no live entry.
    pub cache_misses: u64,
    pub cache_entries: usize,
    pub reconnects: u64,
    pub notifications: u64,
    pub queued: usize,
    pub connections: Vec<ConnectionInfo>,
}

impl Counters {
    pub(crate) fn snapshot(
        &self,
        cache_entries: usize,
        queued: usize,
        connections: Vec<ConnectionInfo>,
    ) -> ClusterStats {
        ClusterStats {
            queries: self.queries.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_entries,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            queued,
            connections,
        }
    }
}
