// src/core/protocol/messages.rs

//! Frontend (client to server) and backend (server to client) message types
//! for version 3.0 of the Postgres wire protocol.

use crate::core::cursor::{Column, ServerError};

/// Protocol version 3.0, as sent in the startup packet.
pub const PROTOCOL_VERSION: i32 = 196_608;
/// The magic code of an `SSLRequest` packet.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// The untyped startup packet.
    Startup { parameters: Vec<(String, String)> },
    /// The untyped TLS negotiation packet.
    SslRequest,
    /// 'p' - Cleartext password.
    Password(String),
    /// 'p' - First SASL message, naming the chosen mechanism.
    SaslInitialResponse { mechanism: String, data: Vec<u8> },
    /// 'p' - Subsequent SASL messages.
    SaslResponse(Vec<u8>),
    /// 'Q' - Simple query. May contain several `;`-separated statements.
    Query(String),
    /// 'f' - Aborts a `COPY FROM STDIN` the pool cannot feed.
    CopyFail(String),
    /// 'X' - Graceful close.
    Terminate,
}

/// Transaction status indicator carried by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I' - Not in a transaction block.
    Idle,
    /// 'T' - In a transaction block.
    InTransaction,
    /// 'E' - In a failed transaction block.
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// The authentication request variants of the 'R' message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue(Vec<u8>),
    SaslFinal(Vec<u8>),
    Unsupported(i32),
}

/// Messages sent by the server that the pool understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// 'R'
    Authentication(AuthRequest),
    /// 'K'
    BackendKeyData { process_id: i32, secret_key: i32 },
    /// 'S'
    ParameterStatus { name: String, value: String },
    /// 'Z'
    ReadyForQuery(TransactionStatus),
    /// 'E'
    ErrorResponse(ServerError),
    /// 'N'
    NoticeResponse(ServerError),
    /// 'T'
    RowDescription(Vec<Column>),
    /// 'D'
    DataRow(Vec<Option<String>>),
    /// 'C'
    CommandComplete(String),
    /// 'I'
    EmptyQueryResponse,
    /// 'A'
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    /// 'G'
    CopyInResponse,
    /// 'H'
    CopyOutResponse,
    /// Any other message type, skipped by the session.
    Other(u8),
}
