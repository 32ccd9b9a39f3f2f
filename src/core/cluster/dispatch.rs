// src/core/cluster/dispatch.rs

//! The per-connection dispatch task.
//!
//! Each pool slot runs one of these for the lifetime of the pool. The task owns the
//! transport session outright; everything it shares with the rest of the pool goes
//! through the pool lock, which is never held across an `.await`.

use super::ClusterInner;
use super::reconnect;
use super::state::Completed;
use crate::core::PoolError;
use crate::core::channels::Notification;
use crate::core::connection::ConnectionId;
use crate::core::transport::{Session, SessionEvent};
use std::sync::Arc;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why `serve` stopped driving a session.
enum Exit {
    Shutdown,
    Lost(PoolError),
}

/// Drives slot `id` until the pool shuts down, reconnecting whenever the session fails.
pub(super) async fn run(
    inner: Arc<ClusterInner>,
    id: ConnectionId,
    mut session: Box<dyn Session>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let wake = inner.state.lock().slots.get(id).map(|slot| slot.wake.clone());
    let Some(wake) = wake else {
        return;
    };

    loop {
        match serve(&inner, id, session.as_mut(), &wake, &mut shutdown_rx).await {
            Exit::Shutdown => {
                let in_flight = inner
                    .state
                    .lock()
                    .slots
                    .get_mut(id)
                    .and_then(|slot| slot.current.take());
                if let Some(request) = in_flight {
                    request.fail(PoolError::Disconnected);
                }
                session.close().await;
                debug!("Dispatch task for connection {} stopped.", id);
                return;
            }
            Exit::Lost(err) => {
                drop(session);
                handle_loss(&inner, id, &err);
                match reconnect::reestablish(&inner, id, &mut shutdown_rx).await {
                    Some(fresh) => session = fresh,
                    None => return,
                }
            }
        }
    }
}

async fn serve(
    inner: &Arc<ClusterInner>,
    id: ConnectionId,
    session: &mut dyn Session,
    wake: &Notify,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Exit {
    loop {
        let next = inner.state.lock().consume(id);
        if let Some(command) = next {
            if let Err(e) = session.send(&command).await {
                if e.is_transport() {
                    return Exit::Lost(e);
                }
                warn!("Connection {} refused to send a command: {}", id, e);
                let rejected = inner.state.lock().reject_current(id);
                if let Some(request) = rejected {
                    request.fail(e);
                }
                continue;
            }
        }

        tokio::select! {
            event = session.recv() => match event {
                Ok(event) => on_event(inner, id, event),
                Err(e) => return Exit::Lost(e),
            },
            _ = wake.notified() => {}
            _ = shutdown_rx.recv() => return Exit::Shutdown,
        }
    }
}

fn on_event(inner: &ClusterInner, id: ConnectionId, event: SessionEvent) {
    match event {
        SessionEvent::Result(result) => {
            let mut state = inner.state.lock();
            match state.slots.get_mut(id).and_then(|s| s.current.as_mut()) {
                Some(request) => request.cursor.push(result),
                None => debug!("Dropping result set on connection {} with nothing in flight.", id),
            }
        }
        SessionEvent::Error(err) => {
            debug!("Server error on connection {}: {}", id, err);
            let mut state = inner.state.lock();
            if let Some(request) = state.slots.get_mut(id).and_then(|s| s.current.as_mut()) {
                request.cursor.set_error(err);
            }
        }
        SessionEvent::Notification(notification) => deliver(inner, notification),
        SessionEvent::Ready(status) => {
            let done = inner.state.lock().complete(id, status, Instant::now());
            if let Some(Completed { request, outcome }) = done {
                inner.counters.increment_completed();
                debug!(
                    "Request {} completed on connection {} in {:?}",
                    request.id,
                    id,
                    request.submitted_at.elapsed()
                );
                request.resolve(outcome);
            }
        }
    }
}

/// Hands a notification to every subscriber of its channel, each on its own task.
pub(super) fn deliver(inner: &ClusterInner, notification: Notification) {
    inner.counters.increment_notifications();
    let callbacks = inner.state.lock().channels.subscribers(&notification.channel);
    if callbacks.is_empty() {
        debug!("No subscribers for notification on '{}'.", notification.channel);
        return;
    }
    let notification = Arc::new(notification);
    for callback in callbacks {
        let notification = notification.clone();
        tokio::spawn(async move { callback(&*notification) });
    }
}

/// Fails everything that was bound to the identity connection `id` just lost.
fn handle_loss(inner: &ClusterInner, id: ConnectionId, err: &PoolError) {
    let loss = inner.state.lock().mark_lost(id);
    let Some(loss) = loss else {
        return;
    };
    warn!(
        "Connection {} lost: {}. Failing {} request(s) bound to it.",
        loss.old_session,
        err,
        loss.orphaned.len() + usize::from(loss.in_flight.is_some())
    );
    if let Some(request) = loss.in_flight {
        request.fail(PoolError::TransportLost);
    }
    for request in loss.orphaned {
        request.fail(PoolError::AffinityViolation(loss.old_session));
    }
}
