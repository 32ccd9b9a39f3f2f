// src/core/cluster/mod.rs

//! The connection pool: a fixed set of connections sharing one request queue, a result
//! cache and a channel registry, all behind a single lock.

pub mod config;
mod dispatch;
mod reconnect;
pub mod state;
pub mod stats;

pub use config::{ClusterConfig, ReconnectConfig};
pub use state::{PoolStatus, ReconnectHook};
pub use stats::ClusterStats;

use crate::core::PoolError;
use crate::core::address::Address;
use crate::core::cache::{QueryCache, cache_key};
use crate::core::channels::{Notification, SubscriptionId, batch_command};
use crate::core::connection::{Connection, ConnectionId, ConnectionInfo, ConnectionState, SessionId};
use crate::core::cursor::Cursor;
use crate::core::request::{Pending, QueryOptions, RequestKind};
use crate::core::transport::Connector;
use futures::future::join_all;
use parking_lot::Mutex;
use state::PoolState;
use stats::Counters;
use std::collections::BTreeSet;
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// The isolation level requested by `tx_begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum Isolation {
    #[strum(serialize = "READ UNCOMMITTED")]
    ReadUncommitted,
    #[default]
    #[strum(serialize = "READ COMMITTED")]
    ReadCommitted,
    #[strum(serialize = "REPEATABLE READ")]
    RepeatableRead,
    #[strum(serialize = "SERIALIZABLE")]
    Serializable,
}

pub(crate) struct ClusterInner {
    pub connector: Arc<dyn Connector>,
    pub config: ClusterConfig,
    pub state: Mutex<PoolState>,
    pub counters: Counters,
}

/// A pool of connections to one server. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    pub fn new(connector: impl Connector, config: ClusterConfig) -> Self {
        Self::with_connector(Arc::new(connector), config)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, config: ClusterConfig) -> Self {
        let cache = QueryCache::new(config.cache.clone());
        Self {
            inner: Arc::new(ClusterInner {
                connector,
                config,
                state: Mutex::new(PoolState::new(cache)),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.state.lock().status
    }

    /// Opens `pool_size` connections to `address` concurrently.
    ///
    /// All handshakes share the `connect_timeout` deadline. If any of them fails, the
    /// connections that did succeed are closed and the pool is left disconnected.
    pub async fn connect(&self, address: Address, pool_size: usize) -> Result<(), PoolError> {
        if pool_size == 0 {
            return Err(PoolError::InvalidRequest(
                "pool size must be at least 1".into(),
            ));
        }
        let epoch = {
            let mut state = self.inner.state.lock();
            if state.status != PoolStatus::Disconnected {
                return Err(PoolError::InvalidRequest(format!(
                    "pool is already {}",
                    state.status
                )));
            }
            state.status = PoolStatus::Connecting;
            state.epoch += 1;
            state.address = Some(address.clone());
            state.slots = (0..pool_size).map(Connection::new).collect();
            state.epoch
        };

        info!("Connecting {} connection(s) to {}", pool_size, address);
        let deadline = self.inner.config.connect_timeout;
        let handshakes = (0..pool_size).map(|_| self.inner.connector.connect(&address));
        let results = match tokio::time::timeout(deadline, join_all(handshakes)).await {
            Ok(results) => results,
            Err(_) => {
                error!("Pool handshakes did not finish within {:?}", deadline);
                self.reset(epoch);
                return Err(PoolError::Connect(format!(
                    "handshakes did not finish within {deadline:?}"
                )));
            }
        };

        let mut sessions = Vec::with_capacity(pool_size);
        let mut failure = None;
        for result in results {
            match result {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(err) = failure {
            error!("Pool connect failed: {}", err);
            join_all(sessions.into_iter().map(|s| s.close())).await;
            self.reset(epoch);
            return Err(match err {
                PoolError::Connect(_) => err,
                other => PoolError::Connect(other.to_string()),
            });
        }

        let superseded = {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch || state.status != PoolStatus::Connecting {
                Some(sessions)
            } else {
                let (shutdown_tx, _) = broadcast::channel(1);
                for (id, session) in sessions.into_iter().enumerate() {
                    if let Some(slot) = state.slots.get_mut(id) {
                        slot.state = ConnectionState::Idle;
                    }
                    let task = tokio::spawn(dispatch::run(
                        self.inner.clone(),
                        id,
                        session,
                        shutdown_tx.subscribe(),
                    ));
                    state.tasks.push(task);
                }
                state.shutdown_tx = Some(shutdown_tx);
                state.status = PoolStatus::Connected;
                None
            }
        };
        if let Some(sessions) = superseded {
            warn!("Pool was disconnected while its connections were being opened.");
            join_all(sessions.into_iter().map(|s| s.close())).await;
            return Err(PoolError::Disconnected);
        }

        info!("Pool connected with {} connection(s).", pool_size);
        Ok(())
    }

    /// Abandons the connect round `epoch`, unless a `disconnect` already did.
    fn reset(&self, epoch: u64) {
        let mut state = self.inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.status = PoolStatus::Disconnected;
        state.slots.clear();
        state.address = None;
    }

    /// Closes every connection. Queued and in-flight requests fail with `Disconnected`.
    /// Subscriptions are kept and apply again after the next `connect`.
    pub async fn disconnect(&self) {
        let (shutdown_tx, tasks, queued) = {
            let mut state = self.inner.state.lock();
            if state.status == PoolStatus::Disconnected {
                return;
            }
            state.status = PoolStatus::Disconnected;
            state.epoch += 1;
            let queued: Vec<_> = state.queue.drain(..).collect();
            (state.shutdown_tx.take(), std::mem::take(&mut state.tasks), queued)
        };

        for request in queued {
            request.fail(PoolError::Disconnected);
        }
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Dispatch task ended abnormally: {}", e);
            }
        }

        let leftovers: Vec<_> = {
            let mut state = self.inner.state.lock();
            let leftovers = state
                .slots
                .iter_mut()
                .filter_map(|slot| slot.current.take())
                .collect();
            state.slots.clear();
            state.address = None;
            state.cache.clear();
            leftovers
        };
        for request in leftovers {
            request.fail(PoolError::Disconnected);
        }
        info!("Pool disconnected.");
    }

    /// Submits `command`. The returned future resolves once the command has run, or
    /// immediately for a live cache entry or a rejected request.
    ///
    /// A server-side error does not fail the future: it resolves with a cursor whose
    /// `error()` is set.
    pub fn query(
        &self,
        command: impl Into<String>,
        options: QueryOptions,
        session: Option<SessionId>,
    ) -> Pending<Cursor> {
        let command = command.into();
        if let Err(e) = validate(&command, options, session) {
            return Pending::failed(e);
        }
        let tier = options.cache_tier().ok().flatten();

        let submitted = {
            let mut state = self.inner.state.lock();
            if let Some(tier) = tier {
                if state.status == PoolStatus::Connected {
                    let hit = state.cache.lookup(&cache_key(&command, tier), Instant::now());
                    if let Some(cursor) = hit {
                        self.inner.counters.increment_hits();
                        return Pending::ready(cursor);
                    }
                    self.inner.counters.increment_misses();
                }
            }
            state.submit(command, options, session, RequestKind::Query)
        };

        match submitted {
            Ok(rx) => {
                self.inner.counters.increment_queries();
                Pending::cursor(rx)
            }
            Err(e) => Pending::failed(e),
        }
    }

    /// Starts listening on the given channels. Channels some connection already listens
    /// on are skipped; the rest go out as one batch on whichever connection is free.
    pub async fn listen<I, S>(&self, channels: I) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested = dedup(channels);
        let rx = {
            let mut state = self.inner.state.lock();
            let owned = state.owned_channels();
            let fresh: Vec<String> = requested
                .into_iter()
                .filter(|c| !owned.contains(c))
                .collect();
            if fresh.is_empty() {
                None
            } else {
                let command = batch_command("LISTEN", &fresh);
                Some(state.submit(command, QueryOptions::empty(), None, RequestKind::Listen(fresh))?)
            }
        };

        if let Some(rx) = rx {
            self.inner.counters.increment_queries();
            server_result(Pending::cursor(rx).await?)?;
        }
        Ok(())
    }

    /// Stops listening on the given channels, with one batched `UNLISTEN` per owning
    /// connection. A connection that is reconnecting just forgets them. Channels nobody
    /// listens on are ignored.
    pub async fn unlisten<I, S>(&self, channels: I) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested = dedup(channels);
        let receivers = {
            let mut state = self.inner.state.lock();
            state.forget_offline(&requested);
            let groups = state.owners_of(&requested);
            groups
                .into_iter()
                .map(|(session, owned)| {
                    let command = batch_command("UNLISTEN", &owned);
                    state.submit(
                        command,
                        QueryOptions::empty(),
                        Some(session),
                        RequestKind::Unlisten(owned),
                    )
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        for result in join_all(receivers.into_iter().map(Pending::cursor)).await {
            self.inner.counters.increment_queries();
            server_result(result?)?;
        }
        Ok(())
    }

    /// Registers a callback for notifications on `channel`. This does not send `LISTEN`;
    /// call `listen` for that.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .channels
            .subscribe(channel, Arc::new(callback))
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        self.inner.state.lock().channels.unsubscribe(channel, id)
    }

    /// Installs a hook that picks the channels a re-established connection listens on.
    /// Without one, a connection resumes exactly the channels it had before.
    pub fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn(ConnectionId, &[String]) -> Vec<String> + Send + Sync + 'static,
    {
        self.inner.state.lock().reconnect_hook = Some(Arc::new(hook));
    }

    /// Opens a transaction and returns the session it is bound to. Pass the session to
    /// `query` to run statements inside it.
    pub async fn tx_begin(&self, isolation: Isolation) -> Result<SessionId, PoolError> {
        let command = format!("BEGIN ISOLATION LEVEL {isolation}");
        let rx = {
            let mut state = self.inner.state.lock();
            state.submit(
                command,
                QueryOptions::TRANSACTION_START,
                None,
                RequestKind::Query,
            )?
        };
        self.inner.counters.increment_queries();
        let (cursor, session) = Pending::with_session(rx).await?;
        server_result(cursor)?;
        session.ok_or_else(|| PoolError::Protocol("transaction start yielded no session".into()))
    }

    pub async fn tx_commit(&self, session: SessionId) -> Result<(), PoolError> {
        self.end_session("COMMIT", session).await
    }

    pub async fn tx_rollback(&self, session: SessionId) -> Result<(), PoolError> {
        self.end_session("ROLLBACK", session).await
    }

    async fn end_session(&self, command: &str, session: SessionId) -> Result<(), PoolError> {
        let cursor = self
            .query(command, QueryOptions::TRANSACTION_END, Some(session))
            .await?;
        server_result(cursor)?;
        Ok(())
    }

    pub fn stats(&self) -> ClusterStats {
        let state = self.inner.state.lock();
        self.inner.counters.snapshot(
            state.cache.len(),
            state.queue.len(),
            state.slots.iter().map(Connection::info).collect(),
        )
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .map(Connection::info)
            .collect()
    }

    /// Evicts every expired cache entry now. Returns the number evicted.
    pub fn sweep_cache(&self) -> usize {
        self.inner.state.lock().cache.sweep(Instant::now())
    }
}

/// Rejects requests that could never run, before anything is queued.
fn validate(command: &str, options: QueryOptions, session: Option<SessionId>) -> Result<(), PoolError> {
    if command.trim().is_empty() {
        return Err(PoolError::InvalidRequest("empty command".into()));
    }
    if command.contains('\0') {
        return Err(PoolError::InvalidRequest(
            "command text contains a NUL byte".into(),
        ));
    }
    options.cache_tier()?;
    if options.contains(QueryOptions::TRANSACTION_START) && session.is_some() {
        return Err(PoolError::InvalidRequest(
            "a transaction cannot be started inside a session".into(),
        ));
    }
    if options.contains(QueryOptions::TRANSACTION_END) && session.is_none() {
        return Err(PoolError::InvalidRequest(
            "ending a transaction requires its session".into(),
        ));
    }
    Ok(())
}

fn server_result(cursor: Cursor) -> Result<Cursor, PoolError> {
    match cursor.error() {
        Some(err) => Err(PoolError::Server(err.clone())),
        None => Ok(cursor),
    }
}

fn dedup<I, S>(channels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = BTreeSet::new();
    channels
        .into_iter()
        .map(Into::into)
        .filter(|c| seen.insert(c.clone()))
        .collect()
}
