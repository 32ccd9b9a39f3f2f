// src/core/transport/mock.rs

//! An in-memory transport with a scriptable server, for tests and benchmarks.
//!
//! Every command sent through a `MockSession` is logged and answered immediately by a
//! responder. The default responder understands a tiny dialect:
//!
//! - `SELECT <text>` returns one row with one column holding `<text>`.
//! - `FAIL ...` raises a server error and aborts the rest of the command.
//! - `HANG ...` never answers, leaving the command in flight.
//! - anything else completes with its first word as the command tag.
//!
//! `LISTEN` / `UNLISTEN` statements are tracked per session, so `notify` reaches exactly
//! the sessions that listen on a channel.

use super::{Connector, Session, SessionEvent};
use crate::core::PoolError;
use crate::core::address::Address;
use crate::core::channels::Notification;
use crate::core::cursor::{Column, ResultSet, ServerError};
use crate::core::protocol::TransactionStatus;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Answers one complete command with the events that precede `ReadyForQuery`.
pub type Responder = Arc<dyn Fn(&str) -> Vec<SessionEvent> + Send + Sync>;

/// One command as the mock server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    /// The serial number of the session, in connect order starting at 0.
    pub session: usize,
    pub command: String,
}

enum Injected {
    Event(SessionEvent),
    Drop,
}

struct SessionHandle {
    serial: usize,
    tx: mpsc::UnboundedSender<Injected>,
    listening: BTreeSet<String>,
    alive: bool,
}

#[derive(Default)]
struct MockState {
    connects: usize,
    refuse: usize,
    connect_delay: Option<Duration>,
    unsendable: Option<String>,
    responder: Option<Responder>,
    log: Vec<SentCommand>,
    sessions: Vec<SessionHandle>,
}

/// The scripted server. Clones share the same server.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the default responder.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Vec<SessionEvent> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Makes the next `n` handshakes fail.
    pub fn refuse_next(&self, n: usize) {
        self.state.lock().refuse = n;
    }

    /// Makes `send` fail locally, without touching the session, for every command that
    /// contains `needle`. Mirrors a command the wire codec refuses to encode.
    pub fn refuse_to_send(&self, needle: &str) {
        self.state.lock().unsendable = Some(needle.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// The number of handshakes attempted so far, failed ones included.
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn log(&self) -> Vec<SentCommand> {
        self.state.lock().log.clone()
    }

    /// Every command sent so far, across all sessions, in arrival order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().log.iter().map(|s| s.command.clone()).collect()
    }

    /// The number of commands sent so far that contain `needle`.
    pub fn count_sent(&self, needle: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|s| s.command.contains(needle))
            .count()
    }

    /// The session serial a command containing `needle` was first sent on.
    pub fn session_of(&self, needle: &str) -> Option<usize> {
        self.state
            .lock()
            .log
            .iter()
            .find(|s| s.command.contains(needle))
            .map(|s| s.session)
    }

    pub fn live_sessions(&self) -> Vec<usize> {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|h| h.alive)
            .map(|h| h.serial)
            .collect()
    }

    /// The channels session `serial` is listening on.
    pub fn listening(&self, serial: usize) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|h| h.serial == serial)
            .map(|h| h.listening.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Breaks session `serial` as if its socket had failed.
    pub fn drop_session(&self, serial: usize) -> bool {
        let mut state = self.state.lock();
        match state.sessions.iter_mut().find(|h| h.serial == serial && h.alive) {
            Some(handle) => {
                handle.alive = false;
                let _ = handle.tx.send(Injected::Drop);
                true
            }
            None => false,
        }
    }

    /// Raises a notification on every live session listening on `channel`. Returns how
    /// many sessions it was delivered to.
    pub fn notify(&self, channel: &str, payload: &str) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for handle in state.sessions.iter().filter(|h| h.alive) {
            if handle.listening.contains(channel) {
                let event = SessionEvent::Notification(Notification {
                    process_id: handle.serial as i32,
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
                if handle.tx.send(Injected::Event(event)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _address: &Address) -> Result<Box<dyn Session>, PoolError> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.connects += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(PoolError::Connect("connection refused".into()));
        }
        let serial = state.sessions.len();
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.push(SessionHandle {
            serial,
            tx: tx.clone(),
            listening: BTreeSet::new(),
            alive: true,
        });
        Ok(Box::new(MockSession {
            serial,
            server: self.state.clone(),
            tx,
            rx,
            status: TransactionStatus::Idle,
        }))
    }
}

pub struct MockSession {
    serial: usize,
    server: Arc<Mutex<MockState>>,
    tx: mpsc::UnboundedSender<Injected>,
    rx: mpsc::UnboundedReceiver<Injected>,
    status: TransactionStatus,
}

impl MockSession {
    fn track_listens(&self, state: &mut MockState, command: &str) {
        let Some(handle) = state.sessions.iter_mut().find(|h| h.serial == self.serial) else {
            return;
        };
        for statement in statements(command) {
            if let Some(channel) = strip_verb(statement, "LISTEN") {
                handle.listening.insert(channel);
            } else if let Some(channel) = strip_verb(statement, "UNLISTEN") {
                handle.listening.remove(&channel);
            }
        }
    }

    /// Applies the transaction effect of every statement that actually ran. After an
    /// error the server skips the rest of the command, `COMMIT` included.
    fn next_status(&self, command: &str, events: &[SessionEvent]) -> TransactionStatus {
        let failed_at = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Error(_)));
        let executed = failed_at.unwrap_or(usize::MAX);

        let mut status = self.status;
        for statement in statements(command).take(executed) {
            match first_word(statement).as_str() {
                "BEGIN" | "START" => status = TransactionStatus::InTransaction,
                "COMMIT" | "ROLLBACK" | "END" | "ABORT" => status = TransactionStatus::Idle,
                _ => {}
            }
        }
        if failed_at.is_some() && status == TransactionStatus::InTransaction {
            status = TransactionStatus::Failed;
        }
        status
    }

    /// What an aborted transaction answers to anything but its own end.
    fn aborted_reply(command: &str) -> Option<Vec<SessionEvent>> {
        let first = statements(command).next().map(first_word)?;
        if matches!(first.as_str(), "COMMIT" | "ROLLBACK" | "END" | "ABORT") {
            return None;
        }
        Some(vec![SessionEvent::Error(ServerError {
            severity: "ERROR".into(),
            code: "25P02".into(),
            message: "current transaction is aborted, commands ignored until end of transaction block".into(),
            ..Default::default()
        })])
    }
}

#[async_trait]
impl Session for MockSession {
    async fn send(&mut self, command: &str) -> Result<(), PoolError> {
        let responder = {
            let mut state = self.server.lock();
            let alive = state
                .sessions
                .iter()
                .any(|h| h.serial == self.serial && h.alive);
            if !alive {
                return Err(PoolError::TransportLost);
            }
            if let Some(needle) = &state.unsendable {
                if command.contains(needle.as_str()) {
                    return Err(PoolError::InvalidRequest(format!(
                        "command cannot be encoded: {command}"
                    )));
                }
            }
            state.log.push(SentCommand {
                session: self.serial,
                command: command.to_string(),
            });
            self.track_listens(&mut state, command);
            state.responder.clone()
        };

        if statements(command).any(|s| first_word(s) == "HANG") {
            return Ok(());
        }
        let aborted = match self.status {
            TransactionStatus::Failed => Self::aborted_reply(command),
            _ => None,
        };
        let events = match (aborted, responder) {
            (Some(events), _) => events,
            (None, Some(responder)) => responder(command),
            (None, None) => default_reply(command),
        };
        self.status = self.next_status(command, &events);
        for event in events {
            let _ = self.tx.send(Injected::Event(event));
        }
        let _ = self.tx.send(Injected::Event(SessionEvent::Ready(self.status)));
        Ok(())
    }

    async fn recv(&mut self) -> Result<SessionEvent, PoolError> {
        match self.rx.recv().await {
            Some(Injected::Event(event)) => Ok(event),
            Some(Injected::Drop) | None => Err(PoolError::TransportLost),
        }
    }

    async fn close(self: Box<Self>) {
        let mut state = self.server.lock();
        if let Some(handle) = state.sessions.iter_mut().find(|h| h.serial == self.serial) {
            handle.alive = false;
        }
    }
}

fn statements(command: &str) -> impl Iterator<Item = &str> {
    command.split(';').map(str::trim).filter(|s| !s.is_empty())
}

fn first_word(statement: &str) -> String {
    statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

fn strip_verb(statement: &str, verb: &str) -> Option<String> {
    let (word, rest) = statement.split_once(char::is_whitespace)?;
    if !word.eq_ignore_ascii_case(verb) {
        return None;
    }
    let rest = rest.trim();
    let name = match rest.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => rest.to_string(),
    };
    Some(name)
}

/// The default responder described in the module docs.
pub fn default_reply(command: &str) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    if statements(command).next().is_none() {
        events.push(SessionEvent::Result(ResultSet::default()));
        return events;
    }
    for statement in statements(command) {
        let verb = first_word(statement);
        match verb.as_str() {
            "SELECT" => {
                let value = statement[6..].trim().to_string();
                events.push(SessionEvent::Result(ResultSet {
                    columns: vec![Column {
                        name: "?column?".into(),
                        type_oid: 25,
                    }],
                    rows: vec![vec![Some(value)]],
                    tag: "SELECT 1".into(),
                }));
            }
            "FAIL" => {
                events.push(SessionEvent::Error(ServerError {
                    severity: "ERROR".into(),
                    code: "P0001".into(),
                    message: format!("forced failure: {statement}"),
                    ..Default::default()
                }));
                break;
            }
            _ => events.push(SessionEvent::Result(ResultSet {
                tag: verb,
                ..Default::default()
            })),
        }
    }
    events
}
