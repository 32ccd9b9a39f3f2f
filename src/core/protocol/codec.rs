// src/core/protocol/codec.rs

//! A `tokio_util::codec` implementation that encodes `FrontendMessage`s and decodes
//! `BackendMessage`s.

use super::messages::{
    AuthRequest, BackendMessage, FrontendMessage, PROTOCOL_VERSION, SSL_REQUEST_CODE,
    TransactionStatus,
};
use crate::core::PoolError;
use crate::core::cursor::{Column, ServerError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum backend message size. Larger messages are treated as a protocol violation.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Header size of a typed message: one type byte plus the length word.
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct PgCodec {
    max_message_size: usize,
}

impl PgCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for PgCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Writes a typed message: the type byte, a length placeholder, the body, then patches the length.
fn put_typed(dst: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    dst.put_u8(tag);
    let len_pos = dst.len();
    dst.put_i32(0);
    body(dst);
    let len = (dst.len() - len_pos) as i32;
    dst[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

impl Encoder<FrontendMessage> for PgCodec {
    type Error = PoolError;

    fn encode(&mut self, item: FrontendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            FrontendMessage::Startup { parameters } => {
                let len_pos = dst.len();
                dst.put_i32(0);
                dst.put_i32(PROTOCOL_VERSION);
                for (name, value) in &parameters {
                    put_cstring(dst, name);
                    put_cstring(dst, value);
                }
                dst.put_u8(0);
                let len = (dst.len() - len_pos) as i32;
                dst[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
            }
            FrontendMessage::SslRequest => {
                dst.put_i32(8);
                dst.put_i32(SSL_REQUEST_CODE);
            }
            FrontendMessage::Password(password) => {
                put_typed(dst, b'p', |b| put_cstring(b, &password));
            }
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                put_typed(dst, b'p', |b| {
                    put_cstring(b, &mechanism);
                    b.put_i32(data.len() as i32);
                    b.put_slice(&data);
                });
            }
            FrontendMessage::SaslResponse(data) => {
                put_typed(dst, b'p', |b| b.put_slice(&data));
            }
            FrontendMessage::Query(sql) => {
                if sql.as_bytes().contains(&0) {
                    return Err(PoolError::InvalidRequest(
                        "query text contains a NUL byte".into(),
                    ));
                }
                put_typed(dst, b'Q', |b| put_cstring(b, &sql));
            }
            FrontendMessage::CopyFail(reason) => {
                put_typed(dst, b'f', |b| put_cstring(b, &reason));
            }
            FrontendMessage::Terminate => {
                put_typed(dst, b'X', |_| {});
            }
        }
        Ok(())
    }
}

impl Decoder for PgCodec {
    type Item = BackendMessage;
    type Error = PoolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = src[0];
        let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if len < 4 {
            return Err(PoolError::Protocol(format!(
                "invalid length {len} for message '{}'",
                tag as char
            )));
        }
        let len = len as usize;
        if len > self.max_message_size {
            return Err(PoolError::Protocol(format!(
                "message '{}' of {len} bytes exceeds the {} byte limit",
                tag as char, self.max_message_size
            )));
        }
        if src.len() < 1 + len {
            src.reserve(1 + len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(1 + len).freeze();
        frame.advance(HEADER_LEN);
        parse_backend(tag, frame).map(Some)
    }
}

fn get_cstring(buf: &mut Bytes) -> Result<String, PoolError> {
    let Some(end) = buf.iter().position(|&b| b == 0) else {
        return Err(PoolError::Protocol("unterminated string".into()));
    };
    let bytes = buf.split_to(end);
    buf.advance(1);
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), PoolError> {
    if buf.remaining() < n {
        return Err(PoolError::Protocol(format!("truncated {what}")));
    }
    Ok(())
}

fn parse_fields(mut body: Bytes) -> Result<ServerError, PoolError> {
    let mut err = ServerError::default();
    loop {
        need(&body, 1, "error fields")?;
        let code = body.get_u8();
        if code == 0 {
            break;
        }
        let value = get_cstring(&mut body)?;
        match code {
            // The non-localized severity wins over the localized one when both are present.
            b'V' => err.severity = value,
            b'S' if err.severity.is_empty() => err.severity = value,
            b'C' => err.code = value,
            b'M' => err.message = value,
            b'D' => err.detail = Some(value),
            b'H' => err.hint = Some(value),
            _ => {}
        }
    }
    Ok(err)
}

fn parse_backend(tag: u8, mut body: Bytes) -> Result<BackendMessage, PoolError> {
    let message = match tag {
        b'R' => {
            need(&body, 4, "authentication request")?;
            let auth = match body.get_i32() {
                0 => AuthRequest::Ok,
                3 => AuthRequest::CleartextPassword,
                5 => {
                    need(&body, 4, "MD5 salt")?;
                    let mut salt = [0u8; 4];
                    body.copy_to_slice(&mut salt);
                    AuthRequest::Md5Password { salt }
                }
                10 => {
                    let mut mechanisms = Vec::new();
                    while body.first().is_some_and(|&b| b != 0) {
                        mechanisms.push(get_cstring(&mut body)?);
                    }
                    AuthRequest::Sasl { mechanisms }
                }
                11 => AuthRequest::SaslContinue(body.to_vec()),
                12 => AuthRequest::SaslFinal(body.to_vec()),
                other => AuthRequest::Unsupported(other),
            };
            BackendMessage::Authentication(auth)
        }
        b'K' => {
            need(&body, 8, "backend key data")?;
            BackendMessage::BackendKeyData {
                process_id: body.get_i32(),
                secret_key: body.get_i32(),
            }
        }
        b'S' => BackendMessage::ParameterStatus {
            name: get_cstring(&mut body)?,
            value: get_cstring(&mut body)?,
        },
        b'Z' => {
            need(&body, 1, "ready for query")?;
            let status = body.get_u8();
            let status = TransactionStatus::from_byte(status).ok_or_else(|| {
                PoolError::Protocol(format!("unknown transaction status '{}'", status as char))
            })?;
            BackendMessage::ReadyForQuery(status)
        }
        b'E' => BackendMessage::ErrorResponse(parse_fields(body)?),
        b'N' => BackendMessage::NoticeResponse(parse_fields(body)?),
        b'T' => {
            need(&body, 2, "row description")?;
            let count = body.get_i16().max(0) as usize;
            let mut columns = Vec::with_capacity(count);
            for _ in 0..count {
                let name = get_cstring(&mut body)?;
                // table oid (4), attribute number (2), type oid (4), size (2), modifier (4), format (2)
                need(&body, 18, "column description")?;
                body.advance(6);
                let type_oid = body.get_u32();
                body.advance(8);
                columns.push(Column { name, type_oid });
            }
            BackendMessage::RowDescription(columns)
        }
        b'D' => {
            need(&body, 2, "data row")?;
            let count = body.get_i16().max(0) as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                need(&body, 4, "data row value length")?;
                let len = body.get_i32();
                if len < 0 {
                    values.push(None);
                    continue;
                }
                let len = len as usize;
                need(&body, len, "data row value")?;
                let raw = body.split_to(len);
                values.push(Some(String::from_utf8_lossy(&raw).into_owned()));
            }
            BackendMessage::DataRow(values)
        }
        b'C' => BackendMessage::CommandComplete(get_cstring(&mut body)?),
        b'I' => BackendMessage::EmptyQueryResponse,
        b'A' => {
            need(&body, 4, "notification")?;
            BackendMessage::NotificationResponse {
                process_id: body.get_i32(),
                channel: get_cstring(&mut body)?,
                payload: get_cstring(&mut body)?,
            }
        }
        b'G' => BackendMessage::CopyInResponse,
        b'H' => BackendMessage::CopyOutResponse,
        other => BackendMessage::Other(other),
    };
    Ok(message)
}
