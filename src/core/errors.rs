// src/core/errors.rs

//! Defines the error types for the pool and the query template driver.

use crate::core::connection::SessionId;
use crate::core::cursor::ServerError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum for everything that can go wrong between a caller and the pool.
///
/// Errors reported by the server itself are not represented here for plain queries:
/// they travel inside the resolved `Cursor` so that a query promise always completes.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The handshake for one or more pool slots failed or timed out.
    #[error("Connect error: {0}")]
    Connect(String),

    /// The socket failed while a request was in flight.
    #[error("Connection lost while the request was in flight")]
    TransportLost,

    /// A request referenced a session that is no longer present in the pool.
    #[error("Session {0} is no longer present in the pool")]
    AffinityViolation(SessionId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Pool is not connected")]
    NotConnected,

    #[error("Pool was disconnected before the request completed")]
    Disconnected,

    /// Malformed or unexpected data on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A server error surfaced by one of the transaction helpers.
    #[error("Server error: {0}")]
    Server(ServerError),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for PoolError {
    fn clone(&self) -> Self {
        match self {
            PoolError::Io(e) => PoolError::Io(Arc::clone(e)),
            PoolError::Connect(s) => PoolError::Connect(s.clone()),
            PoolError::TransportLost => PoolError::TransportLost,
            PoolError::AffinityViolation(id) => PoolError::AffinityViolation(*id),
            PoolError::InvalidRequest(s) => PoolError::InvalidRequest(s.clone()),
            PoolError::NotConnected => PoolError::NotConnected,
            PoolError::Disconnected => PoolError::Disconnected,
            PoolError::Protocol(s) => PoolError::Protocol(s.clone()),
            PoolError::Server(e) => PoolError::Server(e.clone()),
        }
    }
}

impl PartialEq for PoolError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PoolError::Io(e1), PoolError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PoolError::Connect(s1), PoolError::Connect(s2)) => s1 == s2,
            (PoolError::AffinityViolation(a), PoolError::AffinityViolation(b)) => a == b,
            (PoolError::InvalidRequest(s1), PoolError::InvalidRequest(s2)) => s1 == s2,
            (PoolError::Protocol(s1), PoolError::Protocol(s2)) => s1 == s2,
            (PoolError::Server(e1), PoolError::Server(e2)) => e1 == e2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl PoolError {
    /// Returns true if this error was caused by the underlying socket rather than the server.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PoolError::Io(_) | PoolError::TransportLost | PoolError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for PoolError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        PoolError::Protocol(format!("invalid UTF-8 on the wire: {e}"))
    }
}

/// Errors raised while materializing a named query, before anything reaches the pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Unknown query template '{0}'")]
    UnknownTemplate(String),

    #[error("Unknown constant '{0}'")]
    UnknownConstant(String),

    #[error("Query template '{template}' references argument ${index} but only {supplied} were supplied")]
    MissingArgument {
        template: String,
        index: usize,
        supplied: usize,
    },
}
