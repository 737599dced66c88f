//! Request/response correlation.
//!
//! Every outbound request gets the next integer id and a pending entry whose
//! oneshot resolves when the matching response arrives. Ids start at 1 and
//! only restart on an explicit full disconnect.
//!
//! A caller that stops waiting (its future is dropped) releases the entry
//! through [`PendingGuard`], so a late response finds nothing to match.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use kolibri_protocol::RpcError;

use crate::error::{ClientError, ConnectionError};

/// Outcome delivered to a waiting caller.
pub(crate) type Outcome = Result<Value, ClientError>;

struct PendingRequest {
    issued_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

struct CorrelatorState {
    next_id: u64,
    /// Bumped by `reset`; guards from before a reset must not touch reused ids.
    epoch: u64,
    pending: HashMap<u64, PendingRequest>,
}

/// Issues request ids and tracks in-flight requests.
#[derive(Clone)]
pub(crate) struct RequestCorrelator {
    state: Arc<Mutex<CorrelatorState>>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(CorrelatorState {
                next_id: 1,
                epoch: 0,
                pending: HashMap::new(),
            })),
        }
    }
}

impl RequestCorrelator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Allocates the next id and registers it as pending.
    #[cfg(test)]
    pub(crate) fn issue(&self) -> (u64, oneshot::Receiver<Outcome>) {
        let (id, _, rx) = self.register();
        (id, rx)
    }

    /// Allocates the next id and registers it as pending. The entry is
    /// removed again when the returned guard drops.
    pub(crate) fn issue_guarded(&self) -> (PendingGuard, oneshot::Receiver<Outcome>) {
        let (id, epoch, rx) = self.register();
        let guard = PendingGuard {
            correlator: self.clone(),
            id,
            epoch,
        };
        (guard, rx)
    }

    fn register(&self) -> (u64, u64, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(
            id,
            PendingRequest {
                issued_at: Instant::now(),
                tx,
            },
        );
        (id, state.epoch, rx)
    }

    /// Resolves the pending request `id` with the peer's outcome.
    ///
    /// Returns `false` if nothing was waiting on that id.
    pub(crate) fn complete(&self, id: u64, outcome: Result<Value, RpcError>) -> bool {
        let Some(pending) = self.lock().pending.remove(&id) else {
            return false;
        };
        trace!(id, elapsed = ?pending.issued_at.elapsed(), "request completed");
        let _ = pending.tx.send(outcome.map_err(ClientError::from));
        true
    }

    /// Rejects the pending request `id`.
    pub(crate) fn fail(&self, id: u64, error: ClientError) {
        if let Some(pending) = self.lock().pending.remove(&id) {
            let _ = pending.tx.send(Err(error));
        }
    }

    /// Rejects every pending request.
    pub(crate) fn fail_all(&self, error: ConnectionError) {
        let drained: Vec<_> = self.lock().pending.drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), %error, "failing pending requests");
        }
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(ClientError::Connection(error.clone())));
        }
    }

    /// Rejects everything pending and restarts ids at 1.
    pub(crate) fn reset(&self, error: ConnectionError) {
        self.fail_all(error);
        let mut state = self.lock();
        state.next_id = 1;
        state.epoch += 1;
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// Releases a pending entry whose caller went away.
pub(crate) struct PendingGuard {
    correlator: RequestCorrelator,
    id: u64,
    epoch: u64,
}

impl PendingGuard {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.correlator.lock();
        if state.epoch == self.epoch && state.pending.remove(&self.id).is_some() {
            trace!(id = self.id, "request abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_increase_from_one() {
        let correlator = RequestCorrelator::new();
        let (a, _ra) = correlator.issue();
        let (b, _rb) = correlator.issue();
        let (c, _rc) = correlator.issue();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(correlator.pending_count(), 3);
    }

    #[tokio::test]
    async fn complete_resolves_matching_request() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.issue();

        assert!(correlator.complete(id, Ok(json!({"ok": true}))));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn complete_with_error_maps_kind() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.issue();
        let err = RpcError {
            code: -31905,
            message: "denied".into(),
            data: None,
        };
        correlator.complete(id, Err(err));
        match rx.await.unwrap() {
            Err(ClientError::Protocol(p)) => {
                assert_eq!(p.kind, kolibri_protocol::ErrorKind::AccessDenied)
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_id_is_not_matched() {
        let correlator = RequestCorrelator::new();
        let (_id, _rx) = correlator.issue();
        assert!(!correlator.complete(42, Ok(Value::Null)));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn out_of_order_responses_resolve_by_id() {
        let correlator = RequestCorrelator::new();
        let (first, rx1) = correlator.issue();
        let (second, rx2) = correlator.issue();

        correlator.complete(second, Ok(json!("second")));
        correlator.complete(first, Ok(json!("first")));

        assert_eq!(rx1.await.unwrap().unwrap(), json!("first"));
        assert_eq!(rx2.await.unwrap().unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn reset_fails_pending_and_restarts_ids() {
        let correlator = RequestCorrelator::new();
        let (_, rx) = correlator.issue();
        correlator.issue();

        correlator.reset(ConnectionError::Closed);
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::Connection(ConnectionError::Closed))
        ));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.issue().0, 1);
    }

    #[tokio::test]
    async fn fail_rejects_one_request() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.issue();
        let (_other, _rx) = correlator.issue();
        correlator.fail(id, ClientError::Timeout);
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Timeout)));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn dropped_guard_releases_entry() {
        let correlator = RequestCorrelator::new();
        let (guard, _rx) = correlator.issue_guarded();
        let id = guard.id();
        assert_eq!(correlator.pending_count(), 1);

        drop(guard);
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.complete(id, Ok(Value::Null)));
        assert_eq!(correlator.issue().0, 2);
    }

    #[test]
    fn guard_from_before_reset_leaves_reused_id_alone() {
        let correlator = RequestCorrelator::new();
        let (stale, _stale_rx) = correlator.issue_guarded();
        correlator.reset(ConnectionError::Closed);

        let (fresh, _rx) = correlator.issue();
        assert_eq!(fresh, stale.id());
        drop(stale);
        assert_eq!(correlator.pending_count(), 1);
    }
}
