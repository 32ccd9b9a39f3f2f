// src/core/protocol/mod.rs

//! The subset of the Postgres v3 wire protocol the pool speaks: startup, TLS
//! negotiation, cleartext and SCRAM-SHA-256 authentication, and the simple query flow.

pub mod codec;
pub mod messages;
pub mod scram;

pub use codec::PgCodec;
pub use messages::{AuthRequest, BackendMessage, FrontendMessage, TransactionStatus};
pub use scram::ScramClient;
