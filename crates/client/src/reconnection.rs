//! Reconnection loop with exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::ConnectionManager;
use crate::types::{ConnectionState, ReconnectPolicy};

/// Cancels the active reconnect loop, if any.
pub(crate) fn cancel_reconnect(reconnect_cancel: &Mutex<Option<CancellationToken>>) {
    if let Ok(mut guard) = reconnect_cancel.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

/// Clears the stored token once a loop finishes on its own.
///
/// A loop whose token was cancelled has already been replaced (or closed)
/// and must leave the slot alone.
fn release_token(reconnect_cancel: &Mutex<Option<CancellationToken>>, ours: &CancellationToken) {
    if ours.is_cancelled() {
        return;
    }
    if let Ok(mut guard) = reconnect_cancel.lock() {
        *guard = None;
    }
}

/// Reopens the transport until it succeeds, attempts run out, or the loop is
/// cancelled.
///
/// Only a weak reference to the manager is held between attempts so a
/// dropped client does not keep reconnecting.
pub(crate) fn reconnect_loop(
    manager: Weak<ConnectionManager>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut remaining = policy.max_attempts;
        let mut attempt: u32 = 0;

        loop {
            if remaining == Some(0) {
                info!(attempts = attempt, "reconnect attempts exhausted, giving up");
                if let Some(m) = manager.upgrade() {
                    m.set_state(ConnectionState::GivenUp);
                    release_token(&m.reconnect_cancel, &cancel);
                }
                return;
            }

            attempt = attempt.saturating_add(1);
            let delay = policy.delay_for_attempt(attempt);
            match manager.upgrade() {
                Some(m) => m.set_state(ConnectionState::Reconnecting { attempt }),
                None => return,
            }
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(m) = manager.upgrade() else {
                return;
            };
            if cancel.is_cancelled() || !m.reconnect_enabled() {
                return;
            }

            match m.transport.open().await {
                Ok(events) => {
                    if cancel.is_cancelled() || !m.reconnect_enabled() {
                        // Closed while the handshake was in flight.
                        m.transport.close().await;
                        return;
                    }
                    m.set_state(ConnectionState::Connected);
                    m.start_episode(events);
                    release_token(&m.reconnect_cancel, &cancel);
                    info!(attempt, "reconnected");

                    if let Some(handler) = m.handler() {
                        handler.on_reconnected().await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    if let Some(r) = remaining.as_mut() {
                        *r = r.saturating_sub(1);
                    }
                }
            }
        }
    })
}
