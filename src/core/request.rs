// src/core/request.rs

//! Queued logical queries and the promise handed back to callers.

use crate::core::PoolError;
use crate::core::connection::SessionId;
use crate::core::cursor::Cursor;
use bitflags::bitflags;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;

bitflags! {
    /// Per-request behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryOptions: u32 {
        /// Keep the command text on the resulting cursor so it can be re-issued.
        const REUSE_ARGUMENTS    = 1 << 0;
        /// Always run inside a transaction: pinned to the session if one is given,
        /// otherwise wrapped in its own `BEGIN` / `COMMIT`.
        const TRANSACTION_ALWAYS = 1 << 1;
        /// The command opens a transaction; the connection it runs on becomes a session.
        const TRANSACTION_START  = 1 << 2;
        /// The command closes the session's transaction.
        const TRANSACTION_END    = 1 << 3;
        const CACHE_SHORT        = 1 << 4;
        const CACHE_MID          = 1 << 5;
        const CACHE_LONG         = 1 << 6;
    }
}

/// A named cache duration class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheTier {
    Short,
    Mid,
    Long,
}

impl CacheTier {
    /// The suffix appended to the content hash so tiers never share an entry.
    pub fn suffix(self) -> &'static str {
        match self {
            CacheTier::Short => "s",
            CacheTier::Mid => "m",
            CacheTier::Long => "l",
        }
    }
}

impl QueryOptions {
    const CACHE_MASK: QueryOptions = QueryOptions::CACHE_SHORT
        .union(QueryOptions::CACHE_MID)
        .union(QueryOptions::CACHE_LONG);

    /// Returns the requested cache tier. At most one tier flag may be set.
    pub fn cache_tier(self) -> Result<Option<CacheTier>, PoolError> {
        let tiers = self.intersection(Self::CACHE_MASK);
        if tiers.bits().count_ones() > 1 {
            return Err(PoolError::InvalidRequest(
                "at most one cache tier may be requested".into(),
            ));
        }
        Ok(if tiers.contains(Self::CACHE_SHORT) {
            Some(CacheTier::Short)
        } else if tiers.contains(Self::CACHE_MID) {
            Some(CacheTier::Mid)
        } else if tiers.contains(Self::CACHE_LONG) {
            Some(CacheTier::Long)
        } else {
            None
        })
    }
}

/// What the pool must do with a request's result besides resolving the promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Query,
    /// Records the listened channels on the connection that ran the batch.
    Listen(Vec<String>),
    /// Forgets the channels on the connection that ran the batch.
    Unlisten(Vec<String>),
}

/// The value a request resolves with.
pub(crate) type Outcome = Result<(Cursor, Option<SessionId>), PoolError>;

/// One queued logical query, owned by the pool until its promise is resolved.
#[derive(Debug)]
pub(crate) struct Request {
    pub id: u64,
    /// The text actually sent to the server.
    pub command: String,
    /// The text the caller submitted; used as the cache key.
    pub original: String,
    pub submitted_at: Instant,
    pub session: Option<SessionId>,
    pub options: QueryOptions,
    pub kind: RequestKind,
    pub cursor: Cursor,
    reply: Option<oneshot::Sender<Outcome>>,
}

impl Request {
    pub fn new(
        id: u64,
        original: String,
        options: QueryOptions,
        session: Option<SessionId>,
        kind: RequestKind,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let command = if options.contains(QueryOptions::TRANSACTION_ALWAYS) && session.is_none() {
            format!("BEGIN;{};COMMIT", original.trim().trim_end_matches(';'))
        } else {
            original.clone()
        };
        let request = Self {
            id,
            command,
            original,
            submitted_at: Instant::now(),
            session,
            options,
            kind,
            cursor: Cursor::new(),
            reply: Some(tx),
        };
        (request, rx)
    }

    /// True when the command was wrapped in its own `BEGIN` / `COMMIT`.
    pub fn is_wrapped(&self) -> bool {
        self.options.contains(QueryOptions::TRANSACTION_ALWAYS) && self.session.is_none()
    }

    /// Resolves the promise. A caller that dropped its `Pending` simply never sees it.
    pub fn resolve(mut self, outcome: Outcome) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(outcome);
        }
    }

    pub fn fail(self, error: PoolError) {
        self.resolve(Err(error));
    }
}

/// A pending query result. Resolves once the dispatch loop completes the request.
///
/// Dropping it does not cancel the request; the result is simply discarded.
#[must_use = "a Pending does nothing unless awaited"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Outcome>,
    map: fn((Cursor, Option<SessionId>)) -> T,
}

impl Pending<Cursor> {
    pub(crate) fn cursor(rx: oneshot::Receiver<Outcome>) -> Self {
        Self {
            rx,
            map: |(cursor, _)| cursor,
        }
    }

    /// A promise that is already satisfied, used for cache hits.
    pub(crate) fn ready(cursor: Cursor) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok((cursor, None)));
        Self::cursor(rx)
    }

    /// A promise that has already failed, used for pre-flight rejections.
    pub(crate) fn failed(error: PoolError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::cursor(rx)
    }
}

impl Pending<(Cursor, Option<SessionId>)> {
    pub(crate) fn with_session(rx: oneshot::Receiver<Outcome>) -> Self {
        Self { rx, map: |pair| pair }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let map = self.map;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome.map(map)),
            // The pool dropped the request without resolving it, which only happens on teardown.
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
