// src/core/transport/mod.rs

//! The seam between the pool and the wire.
//!
//! A `Connector` performs the asynchronous handshake for one pool slot and yields a
//! `Session`, which the slot's dispatch task then owns exclusively. The pool only ever
//! uses three verbs on a session: send a command, receive the next event, close.

pub mod mock;
pub mod postgres;

use crate::core::PoolError;
use crate::core::address::Address;
use crate::core::channels::Notification;
use crate::core::cursor::{ResultSet, ServerError};
use crate::core::protocol::TransactionStatus;
use async_trait::async_trait;

pub use mock::MockConnector;
pub use postgres::{PgConnector, PgSession};

/// One unit of server output, as seen by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A complete result set for one statement of the current command.
    Result(ResultSet),
    /// The server rejected the current command. More events follow until `Ready`.
    Error(ServerError),
    /// An asynchronous notification. May arrive at any time, busy or not.
    Notification(Notification),
    /// The current command is complete and the session accepts a new one.
    Ready(TransactionStatus),
}

/// Opens sessions to a server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &Address) -> Result<Box<dyn Session>, PoolError>;
}

/// An established server session.
#[async_trait]
pub trait Session: Send {
    /// Sends one command, which may contain several `;`-separated statements.
    async fn send(&mut self, command: &str) -> Result<(), PoolError>;

    /// Waits for the next event. Must be cancel-safe: the dispatch loop races it against
    /// wake-ups and drops the future when one of those wins.
    async fn recv(&mut self) -> Result<SessionEvent, PoolError>;

    /// Closes the session gracefully. Errors are ignored.
    async fn close(self: Box<Self>);
}
