// src/core/channels.rs

//! Subscriber bookkeeping for server notifications (`LISTEN` / `NOTIFY`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// An asynchronous notification delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The backend process that raised the notification.
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Identifies one subscription. Ids are strictly increasing per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A subscriber callback. Invoked on a spawned task, never under the pool lock.
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Maps each channel to its subscribers.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, BTreeMap<SubscriptionId, Callback>>,
    next_id: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, channel: &str, callback: Callback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, callback);
        id
    }

    /// Removes one subscription. Returns false if it did not exist.
    pub fn unsubscribe(&mut self, channel: &str, id: SubscriptionId) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Snapshot of the callbacks for a channel, in subscription order.
    pub fn subscribers(&self, channel: &str) -> Vec<Callback> {
        self.channels
            .get(channel)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, BTreeMap::len)
    }

    /// Returns a list of all channels with at least one subscriber.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channels())
            .field("next_id", &self.next_id)
            .finish()
    }
}

/// Quotes a channel name as an SQL identifier.
pub fn quote_channel(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds one batched `LISTEN a;LISTEN b` (or `UNLISTEN`) command.
pub fn batch_command(verb: &str, channels: &[String]) -> String {
    channels
        .iter()
        .map(|c| format!("{verb} {}", quote_channel(c)))
        .collect::<Vec<_>>()
        .join(";")
}
