// src/lib.rs

pub mod config;
pub mod core;

// Re-export
pub use crate::core::{
    Address, Cluster, ClusterConfig, Cursor, Driver, DriverError, Isolation, PoolError,
    QueryOptions, SessionId,
};
