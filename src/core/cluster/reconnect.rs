// src/core/cluster/reconnect.rs

//! Re-establishes a lost connection with exponential backoff and restores its
//! `LISTEN` subscriptions.

use super::ClusterInner;
use super::dispatch;
use crate::core::PoolError;
use crate::core::channels::batch_command;
use crate::core::connection::{ConnectionId, ConnectionState};
use crate::core::transport::{Session, SessionEvent};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Retries the handshake for slot `id` until it succeeds or the pool shuts down.
/// Returns `None` on shutdown.
pub(super) async fn reestablish(
    inner: &Arc<ClusterInner>,
    id: ConnectionId,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Option<Box<dyn Session>> {
    let backoff = &inner.config.reconnect;
    let mut delay = backoff.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let jitter_cap = (delay.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
        let wait_time = delay + jitter;
        info!(
            "Will try to re-establish connection {} in {:?} (attempt {}).",
            id, wait_time, attempt
        );

        tokio::select! {
            _ = tokio::time::sleep(wait_time) => {}
            _ = shutdown_rx.recv() => {
                info!("Connection {} shutting down during backoff.", id);
                return None;
            }
        }

        let address = {
            let mut state = inner.state.lock();
            let slot = state.slots.get_mut(id)?;
            slot.state = ConnectionState::Connecting;
            state.address.clone()
        }?;

        let result = tokio::select! {
            result = inner.connector.connect(&address) => result,
            _ = shutdown_rx.recv() => return None,
        };

        match result {
            Ok(mut session) => match resubscribe(inner, id, session.as_mut()).await {
                Ok(channels) => {
                    let generation = {
                        let mut state = inner.state.lock();
                        let slot = state.slots.get_mut(id)?;
                        slot.listening = channels.into_iter().collect();
                        slot.state = ConnectionState::Idle;
                        slot.wake.notify_one();
                        slot.generation
                    };
                    inner.counters.increment_reconnects();
                    info!(
                        "Connection {} re-established as generation {} after {} attempt(s).",
                        id, generation, attempt
                    );
                    return Some(session);
                }
                Err(e) => warn!("Restoring subscriptions on connection {} failed: {}", id, e),
            },
            Err(e) => warn!("Reconnect attempt {} for connection {} failed: {}", attempt, id, e),
        }

        delay = backoff.next_delay(delay);
    }
}

/// Sends one batched `LISTEN` for the channels the slot should own and waits for it to
/// complete. Returns the channels that are now listened on.
async fn resubscribe(
    inner: &ClusterInner,
    id: ConnectionId,
    session: &mut dyn Session,
) -> Result<Vec<String>, PoolError> {
    let (preserved, hook) = {
        let state = inner.state.lock();
        let preserved: Vec<String> = state
            .slots
            .get(id)
            .map(|slot| slot.listening.iter().cloned().collect())
            .unwrap_or_default();
        (preserved, state.reconnect_hook.clone())
    };
    let channels = match hook {
        Some(hook) => hook(id, &preserved),
        None => preserved,
    };
    if channels.is_empty() {
        return Ok(channels);
    }

    session.send(&batch_command("LISTEN", &channels)).await?;
    let mut rejected = false;
    loop {
        match session.recv().await? {
            SessionEvent::Ready(_) => break,
            SessionEvent::Error(err) => {
                warn!("Server rejected LISTEN on connection {}: {}", id, err);
                rejected = true;
            }
            SessionEvent::Notification(notification) => dispatch::deliver(inner, notification),
            SessionEvent::Result(_) => {}
        }
    }

    // A failed statement aborts the whole batch.
    if rejected {
        return Ok(Vec::new());
    }
    info!("Connection {} listening again on {} channel(s).", id, channels.len());
    Ok(channels)
}
