// src/core/transport/postgres.rs

//! A `Session` over a real Postgres-wire socket, plain TCP or TLS.

use super::{Connector, Session, SessionEvent};
use crate::core::PoolError;
use crate::core::address::{Address, SslMode};
use crate::core::channels::Notification;
use crate::core::cursor::ResultSet;
use crate::core::protocol::scram::SCRAM_SHA_256;
use crate::core::protocol::{AuthRequest, BackendMessage, FrontendMessage, PgCodec, ScramClient};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsConnector, rustls};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// The socket under a session: plain TCP, or TCP upgraded after `SSLRequest`.
enum PgStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PgStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            PgStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            PgStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            PgStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens Postgres sessions, negotiating TLS according to the address's `sslmode`.
#[derive(Clone)]
pub struct PgConnector {
    tls: Arc<rustls::ClientConfig>,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl PgConnector {
    /// Builds a connector that verifies servers against the bundled web PKI roots.
    pub fn new() -> Self {
        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        Self::with_tls_config(Arc::new(tls_config))
    }

    pub fn with_tls_config(tls: Arc<rustls::ClientConfig>) -> Self {
        Self { tls }
    }

    async fn negotiate_tls(&self, mut tcp: TcpStream, address: &Address) -> Result<PgStream, PoolError> {
        let mode = address.ssl_mode();
        if mode == SslMode::Disable {
            return Ok(PgStream::Tcp(tcp));
        }

        let mut request = bytes::BytesMut::new();
        tokio_util::codec::Encoder::encode(&mut PgCodec::new(), FrontendMessage::SslRequest, &mut request)?;
        tcp.write_all(&request).await?;

        match tcp.read_u8().await? {
            b'S' => {
                let domain = rustls::pki_types::ServerName::try_from(address.server_name())
                    .map_err(|_| PoolError::Connect("Invalid TLS domain name".into()))?
                    .to_owned();
                let connector = TlsConnector::from(self.tls.clone());
                let tls_stream = connector
                    .connect(domain, tcp)
                    .await
                    .map_err(|e| PoolError::Connect(format!("TLS handshake failed: {e}")))?;
                Ok(PgStream::Tls(Box::new(tls_stream)))
            }
            b'N' if mode == SslMode::Require => Err(PoolError::Connect(
                "server does not support TLS but sslmode=require".into(),
            )),
            b'N' => {
                debug!("Server declined TLS, continuing in plaintext.");
                Ok(PgStream::Tcp(tcp))
            }
            other => Err(PoolError::Protocol(format!(
                "unexpected reply '{}' to SSLRequest",
                other as char
            ))),
        }
    }

    async fn handshake(&self, address: &Address) -> Result<PgSession, PoolError> {
        let addr = address.socket_addr();
        debug!("Opening connection to {}", addr);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| PoolError::Connect(format!("Failed to connect to {addr}: {e}")))?;
        tcp.set_nodelay(true)?;

        let stream = self.negotiate_tls(tcp, address).await?;
        let mut framed = Framed::new(stream, PgCodec::new());
        framed
            .send(FrontendMessage::Startup {
                parameters: address.startup_parameters(),
            })
            .await?;

        authenticate(&mut framed, address).await?;

        let mut session = PgSession {
            framed,
            pending: None,
            process_id: 0,
            parameters: HashMap::new(),
        };
        session.await_startup().await?;
        Ok(session)
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, address: &Address) -> Result<Box<dyn Session>, PoolError> {
        let session = match address.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.handshake(address))
                .await
                .map_err(|_| PoolError::Connect(format!("handshake timed out after {limit:?}")))??,
            None => self.handshake(address).await?,
        };
        info!(
            "Connected to {} (backend pid {}, server {})",
            address.socket_addr(),
            session.process_id,
            session.parameter("server_version").unwrap_or("unknown")
        );
        Ok(Box::new(session))
    }
}

async fn next_message(
    framed: &mut Framed<PgStream, PgCodec>,
) -> Result<BackendMessage, PoolError> {
    match framed.next().await {
        Some(result) => result,
        None => Err(PoolError::TransportLost),
    }
}

/// Runs the authentication exchange until `AuthenticationOk`.
async fn authenticate(
    framed: &mut Framed<PgStream, PgCodec>,
    address: &Address,
) -> Result<(), PoolError> {
    let password = || {
        address
            .password()
            .ok_or_else(|| PoolError::Connect("server requested a password but none was configured".into()))
    };
    let mut scram: Option<ScramClient> = None;

    loop {
        match next_message(framed).await? {
            BackendMessage::Authentication(AuthRequest::Ok) => return Ok(()),
            BackendMessage::Authentication(AuthRequest::CleartextPassword) => {
                framed
                    .send(FrontendMessage::Password(password()?.to_string()))
                    .await?;
            }
            BackendMessage::Authentication(AuthRequest::Sasl { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PoolError::Connect(format!(
                        "no supported SASL mechanism among {mechanisms:?}"
                    )));
                }
                let client = ScramClient::new(password()?);
                framed
                    .send(FrontendMessage::SaslInitialResponse {
                        mechanism: SCRAM_SHA_256.to_string(),
                        data: client.client_first(),
                    })
                    .await?;
                scram = Some(client);
            }
            BackendMessage::Authentication(AuthRequest::SaslContinue(data)) => {
                let client = scram
                    .as_mut()
                    .ok_or_else(|| PoolError::Protocol("SASL continue without SASL start".into()))?;
                let reply = client.handle_server_first(&data)?;
                framed.send(FrontendMessage::SaslResponse(reply)).await?;
            }
            BackendMessage::Authentication(AuthRequest::SaslFinal(data)) => {
                let client = scram
                    .as_mut()
                    .ok_or_else(|| PoolError::Protocol("SASL final without SASL start".into()))?;
                client.handle_server_final(&data)?;
            }
            BackendMessage::Authentication(AuthRequest::Md5Password { .. }) => {
                return Err(PoolError::Connect(
                    "MD5 password authentication is not supported; use scram-sha-256".into(),
                ));
            }
            BackendMessage::Authentication(AuthRequest::Unsupported(code)) => {
                return Err(PoolError::Connect(format!(
                    "unsupported authentication request {code}"
                )));
            }
            BackendMessage::ErrorResponse(err) => {
                return Err(PoolError::Connect(err.to_string()));
            }
            BackendMessage::NoticeResponse(notice) => debug!("Notice during startup: {}", notice),
            other => {
                return Err(PoolError::Protocol(format!(
                    "unexpected message during authentication: {other:?}"
                )));
            }
        }
    }
}

/// An established Postgres session.
pub struct PgSession {
    framed: Framed<PgStream, PgCodec>,
    /// The result set currently being assembled from `RowDescription` / `DataRow`.
    pending: Option<ResultSet>,
    process_id: i32,
    parameters: HashMap<String, String>,
}

impl PgSession {
    /// Consumes the post-authentication messages up to the first `ReadyForQuery`.
    async fn await_startup(&mut self) -> Result<(), PoolError> {
        loop {
            match next_message(&mut self.framed).await? {
                BackendMessage::BackendKeyData { process_id, .. } => self.process_id = process_id,
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ReadyForQuery(_) => return Ok(()),
                BackendMessage::ErrorResponse(err) => {
                    return Err(PoolError::Connect(err.to_string()));
                }
                BackendMessage::NoticeResponse(notice) => debug!("Notice during startup: {}", notice),
                other => debug!("Ignoring {:?} during startup", other),
            }
        }
    }

    /// A server parameter reported during startup or later via `ParameterStatus`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }
}

#[async_trait]
impl Session for PgSession {
    async fn send(&mut self, command: &str) -> Result<(), PoolError> {
        self.framed
            .send(FrontendMessage::Query(command.to_string()))
            .await
    }

    async fn recv(&mut self) -> Result<SessionEvent, PoolError> {
        loop {
            match next_message(&mut self.framed).await? {
                BackendMessage::RowDescription(columns) => {
                    self.pending = Some(ResultSet {
                        columns,
                        ..Default::default()
                    });
                }
                BackendMessage::DataRow(values) => {
                    self.pending.get_or_insert_default().rows.push(values);
                }
                BackendMessage::CommandComplete(tag) => {
                    let mut result = self.pending.take().unwrap_or_default();
                    result.tag = tag;
                    return Ok(SessionEvent::Result(result));
                }
                BackendMessage::EmptyQueryResponse => {
                    return Ok(SessionEvent::Result(ResultSet::default()));
                }
                BackendMessage::ErrorResponse(err) => {
                    self.pending = None;
                    return Ok(SessionEvent::Error(err));
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    return Ok(SessionEvent::Notification(Notification {
                        process_id,
                        channel,
                        payload,
                    }));
                }
                BackendMessage::ReadyForQuery(status) => {
                    return Ok(SessionEvent::Ready(status));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => debug!("Server notice: {}", notice),
                BackendMessage::CopyInResponse => {
                    warn!("COPY FROM STDIN is not supported by the pool; aborting it.");
                    self.framed
                        .send(FrontendMessage::CopyFail(
                            "COPY FROM STDIN is not supported by this client".into(),
                        ))
                        .await?;
                }
                other => debug!("Skipping backend message {:?}", other),
            }
        }
    }

    async fn close(mut self: Box<Self>) {
        let _ = self.framed.send(FrontendMessage::Terminate).await;
        let _ = self.framed.get_mut().shutdown().await;
    }
}
