// src/core/cluster/state.rs

//! The state guarded by the pool lock, and the scheduling rules that act on it.
//!
//! Everything here is synchronous. Callers take the lock, call one of these methods, drop
//! the lock, and only then resolve promises or run callbacks with what was returned.

use crate::core::PoolError;
use crate::core::address::Address;
use crate::core::cache::{QueryCache, cache_key};
use crate::core::channels::ChannelRegistry;
use crate::core::connection::{Connection, ConnectionId, ConnectionState, SessionId};
use crate::core::protocol::TransactionStatus;
use crate::core::request::{Outcome, QueryOptions, Request, RequestKind};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A hook consulted after a connection is re-established. It receives the slot id and
/// the channels that slot was listening on, and returns the channels to listen on now.
pub type ReconnectHook = Arc<dyn Fn(ConnectionId, &[String]) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PoolStatus {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) struct PoolState {
    pub status: PoolStatus,
    /// Bumped by every `connect` and `disconnect`, so a handshake round can tell
    /// whether the pool it started is still the current one.
    pub epoch: u64,
    pub address: Option<Address>,
    pub slots: Vec<Connection>,
    pub queue: VecDeque<Request>,
    pub cache: QueryCache,
    pub channels: ChannelRegistry,
    pub next_request_id: u64,
    pub reconnect_hook: Option<ReconnectHook>,
    pub shutdown_tx: Option<broadcast::Sender<()>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// A request detached from its connection on `ReadyForQuery`, ready to be resolved.
pub(crate) struct Completed {
    pub request: Request,
    pub outcome: Outcome,
}

/// What a connection loss left behind.
pub(crate) struct Loss {
    pub old_session: SessionId,
    pub in_flight: Option<Request>,
    /// Queued requests pinned to the identity that no longer exists.
    pub orphaned: Vec<Request>,
}

impl PoolState {
    pub fn new(cache: QueryCache) -> Self {
        Self {
            status: PoolStatus::Disconnected,
            epoch: 0,
            address: None,
            slots: Vec::new(),
            queue: VecDeque::new(),
            cache,
            channels: ChannelRegistry::new(),
            next_request_id: 1,
            reconnect_hook: None,
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// True if `session` still names a live connection in this pool.
    pub fn session_alive(&self, session: SessionId) -> bool {
        self.slots
            .get(session.connection)
            .is_some_and(|slot| slot.holds(session))
    }

    /// Builds a request and queues it, after checking that the pool is connected and
    /// that a pinned session still exists.
    pub fn submit(
        &mut self,
        command: String,
        options: QueryOptions,
        session: Option<SessionId>,
        kind: RequestKind,
    ) -> Result<oneshot::Receiver<Outcome>, PoolError> {
        if self.status != PoolStatus::Connected {
            return Err(PoolError::NotConnected);
        }
        if let Some(session) = session {
            if !self.session_alive(session) {
                return Err(PoolError::AffinityViolation(session));
            }
        }
        let id = self.next_id();
        let (request, rx) = Request::new(id, command, options, session, kind);
        self.enqueue(request);
        Ok(rx)
    }

    /// Appends a request to the tail of the queue and wakes every idle connection so
    /// that each gets a chance to consume.
    pub fn enqueue(&mut self, request: Request) {
        debug!("Queued request {} ({} waiting)", request.id, self.queue.len() + 1);
        self.queue.push_back(request);
        for slot in &self.slots {
            if slot.state == ConnectionState::Idle {
                slot.wake.notify_one();
            }
        }
    }

    /// Assigns the first eligible queued request to connection `id` if it is idle, and
    /// returns the command text the dispatch task must send.
    pub fn consume(&mut self, id: ConnectionId) -> Option<String> {
        let slot = self.slots.get_mut(id)?;
        if slot.state != ConnectionState::Idle || slot.current.is_some() {
            return None;
        }
        if slot.rollback_pending {
            slot.rollback_pending = false;
            slot.state = ConnectionState::Busy;
            debug!("Connection {} rolls back an abandoned transaction", slot.session_id());
            return Some("ROLLBACK".to_string());
        }
        let session = slot.session_id();
        let in_session = slot.in_session;
        let pos = self.queue.iter().position(|r| match r.session {
            Some(pinned) => pinned == session,
            None => !in_session,
        })?;
        let request = self.queue.remove(pos)?;
        let command = request.command.clone();
        debug!(
            "Connection {} takes request {} after {:?} in queue",
            session,
            request.id,
            request.submitted_at.elapsed()
        );
        slot.state = ConnectionState::Busy;
        slot.current = Some(request);
        Some(command)
    }

    /// Detaches the in-flight request of connection `id` after `ReadyForQuery` and
    /// applies its side effects: transaction flags, listen bookkeeping and caching.
    pub fn complete(
        &mut self,
        id: ConnectionId,
        status: TransactionStatus,
        now: Instant,
    ) -> Option<Completed> {
        let slot = self.slots.get_mut(id)?;
        let Some(mut request) = slot.current.take() else {
            // The `ROLLBACK` sent by `consume` has no request behind it.
            if slot.state == ConnectionState::Busy {
                slot.state = ConnectionState::Idle;
            }
            return None;
        };
        slot.state = ConnectionState::Idle;
        let session = slot.session_id();
        let succeeded = request.cursor.is_ok();

        let mut yielded = None;
        if request.options.contains(QueryOptions::TRANSACTION_START) && succeeded {
            slot.in_session = true;
            yielded = Some(session);
        }
        if request.options.contains(QueryOptions::TRANSACTION_END) {
            slot.in_session = false;
        }
        if status != TransactionStatus::Idle && !slot.in_session {
            warn!(
                "Connection {} was left in a {:?} transaction outside any session; rolling it back",
                session, status
            );
            slot.rollback_pending = true;
        }

        match &request.kind {
            RequestKind::Listen(channels) if succeeded => {
                slot.listening.extend(channels.iter().cloned());
            }
            RequestKind::Unlisten(channels) => {
                for channel in channels {
                    slot.listening.remove(channel);
                }
            }
            _ => {}
        }

        if request.is_wrapped() {
            request.cursor.strip_transaction_wrapper();
        }
        if request.options.contains(QueryOptions::REUSE_ARGUMENTS) {
            let command = request.original.clone();
            request.cursor.set_command(command);
        }
        if succeeded && request.kind == RequestKind::Query {
            if let Ok(Some(tier)) = request.options.cache_tier() {
                self.cache.store(
                    cache_key(&request.original, tier),
                    request.cursor.clone(),
                    tier,
                    now,
                );
            }
        }

        let cursor = std::mem::take(&mut request.cursor);
        Some(Completed {
            request,
            outcome: Ok((cursor, yielded)),
        })
    }

    /// Marks connection `id` lost, changing its identity, and collects the requests that
    /// can no longer complete.
    pub fn mark_lost(&mut self, id: ConnectionId) -> Option<Loss> {
        let slot = self.slots.get_mut(id)?;
        let old_session = slot.session_id();
        let in_flight = slot.mark_lost();

        let (orphaned, kept): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|r| r.session == Some(old_session));
        self.queue = kept.into();

        Some(Loss {
            old_session,
            in_flight,
            orphaned,
        })
    }

    /// Fails the request connection `id` could not send, leaving the connection idle.
    /// The server never saw the command, so the session is intact.
    pub fn reject_current(&mut self, id: ConnectionId) -> Option<Request> {
        let slot = self.slots.get_mut(id)?;
        slot.state = ConnectionState::Idle;
        slot.current.take()
    }

    /// Forgets `channels` on connections that have no server session right now.
    /// They will not be listened on again after reconnection.
    pub fn forget_offline(&mut self, channels: &[String]) {
        for slot in self
            .slots
            .iter_mut()
            .filter(|slot| !slot.holds(slot.session_id()))
        {
            for channel in channels {
                if slot.listening.remove(channel) {
                    debug!("Connection {} forgets '{}' while offline", slot.id, channel);
                }
            }
        }
    }

    /// Every channel some connection is listening on, or has a pending `LISTEN` for.
    pub fn owned_channels(&self) -> BTreeSet<String> {
        let mut owned: BTreeSet<String> = BTreeSet::new();
        for slot in &self.slots {
            owned.extend(slot.listening.iter().cloned());
            if let Some(RequestKind::Listen(channels)) = slot.current.as_ref().map(|r| &r.kind) {
                owned.extend(channels.iter().cloned());
            }
        }
        for request in &self.queue {
            if let RequestKind::Listen(channels) = &request.kind {
                owned.extend(channels.iter().cloned());
            }
        }
        owned
    }

    /// Groups `channels` by the connection currently listening on them.
    pub fn owners_of(&self, channels: &[String]) -> Vec<(SessionId, Vec<String>)> {
        self.slots
            .iter()
            .filter(|slot| slot.holds(slot.session_id()))
            .filter_map(|slot| {
                let mine: Vec<String> = channels
                    .iter()
                    .filter(|c| slot.listening.contains(*c))
                    .cloned()
                    .collect();
                (!mine.is_empty()).then(|| (slot.session_id(), mine))
            })
            .collect()
    }
}
