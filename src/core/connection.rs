// src/core/connection.rs

//! The pool-side record of one physical connection.
//!
//! A `Connection` is passive: every transition is made by the cluster while it holds the
//! pool lock. The transport session itself is owned by the slot's dispatch task.

use crate::core::request::Request;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::Notify;

/// The stable slot index of a connection within the pool.
pub type ConnectionId = usize;

/// Identifies one server-side session: a slot plus the generation of the socket in it.
///
/// The generation changes every time the slot loses its socket, so a session id taken
/// before a reconnection never matches the replacement connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub connection: ConnectionId,
    pub generation: u64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.connection, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ConnectionState {
    /// A handshake is in progress; the slot does not take requests.
    Connecting,
    Idle,
    /// A command has been sent and its results have not fully arrived.
    Busy,
    /// The socket failed; reconnection is pending.
    Lost,
}

#[derive(Debug)]
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) generation: u64,
    pub(crate) state: ConnectionState,
    pub(crate) current: Option<Request>,
    pub(crate) in_session: bool,
    pub(crate) listening: BTreeSet<String>,
    /// The server left this connection inside a transaction nobody owns. A `ROLLBACK`
    /// goes out before it takes any more work.
    pub(crate) rollback_pending: bool,
    /// Wakes the slot's dispatch task when work is assigned to it.
    pub(crate) wake: Arc<Notify>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId) -> Self {
        Self {
            id,
            generation: 0,
            state: ConnectionState::Connecting,
            current: None,
            in_session: false,
            listening: BTreeSet::new(),
            rollback_pending: false,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn session_id(&self) -> SessionId {
        SessionId {
            connection: self.id,
            generation: self.generation,
        }
    }

    /// True if `session` names this exact connection and it is still alive.
    pub(crate) fn holds(&self, session: SessionId) -> bool {
        self.session_id() == session
            && matches!(self.state, ConnectionState::Idle | ConnectionState::Busy)
    }

    /// Marks the connection lost and changes its identity. Returns the in-flight request.
    pub(crate) fn mark_lost(&mut self) -> Option<Request> {
        self.state = ConnectionState::Lost;
        self.generation += 1;
        self.in_session = false;
        self.rollback_pending = false;
        self.current.take()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            generation: self.generation,
            state: self.state,
            in_session: self.in_session,
            listening: self.listening.iter().cloned().collect(),
            current_request: self.current.as_ref().map(|r| r.id),
        }
    }
}

/// A point-in-time snapshot of a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub generation: u64,
    pub state: ConnectionState,
    pub in_session: bool,
    pub listening: Vec<String>,
    pub current_request: Option<u64>,
}
