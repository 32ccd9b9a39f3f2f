// src/core/mod.rs

//! The central module containing the pool and everything it is built from.

pub mod address;
pub mod cache;
pub mod channels;
pub mod cluster;
pub mod connection;
pub mod cursor;
pub mod driver;
pub mod errors;
pub mod protocol;
pub mod request;
pub mod transport;

pub use address::{Address, SslMode};
pub use channels::{Notification, SubscriptionId};
pub use cluster::{Cluster, ClusterConfig, ClusterStats, Isolation, PoolStatus};
pub use connection::{ConnectionId, ConnectionInfo, ConnectionState, SessionId};
pub use cursor::{Column, Cursor, ResultSet, Row, ServerError};
pub use driver::Driver;
pub use errors::{DriverError, PoolError};
pub use request::{CacheTier, Pending, QueryOptions};
