//! Connection manager owning the transport.
//!
//! Opens and closes the socket, runs one read loop per connection episode,
//! and reconnects automatically with exponential backoff on unexpected
//! disconnects. Inbound messages and lifecycle changes are handed to a
//! [`ConnectionHandler`].

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::ConnectionError;
use crate::listeners::panic_message;
use crate::reconnection::{cancel_reconnect, reconnect_loop};
use crate::transport::{CLOSE_ABNORMAL, Transport, TransportError, TransportEvent};
use crate::types::{ConnectionState, ReconnectPolicy};

/// A boxed future returned by [`ConnectionHandler`] callbacks.
pub(crate) type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receives what happens on the connection.
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    /// An inbound text frame. Awaited before the next frame is handled.
    fn on_message(&self, text: String) -> HandlerFuture<'_>;

    /// Offered frames that arrive while `on_message` is still running.
    /// Returning `true` consumes the frame (a response that can be matched
    /// right away); `false` queues it behind the running message.
    fn on_response(&self, _text: &str) -> bool {
        false
    }

    /// The connection left `Connected`. Called once per episode.
    fn on_disconnected(&self, code: u16, reason: &str);

    /// A reconnect succeeded and the new read loop is running.
    fn on_reconnected(&self) -> HandlerFuture<'_>;
}

/// Connection manager for a single broker connection.
pub(crate) struct ConnectionManager {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) policy: Option<ReconnectPolicy>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_enabled: AtomicBool,
    /// Set once the disconnect callback ran for the current episode.
    disconnect_fired: AtomicBool,
    /// Incremented per episode; read loops of older episodes are ignored.
    generation: AtomicU64,
    pub(crate) reconnect_cancel: Mutex<Option<CancellationToken>>,
    handler: Mutex<Option<Weak<dyn ConnectionHandler>>>,
}

impl ConnectionManager {
    pub(crate) fn new(transport: Arc<dyn Transport>, policy: Option<ReconnectPolicy>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            policy,
            state_tx,
            reconnect_enabled: AtomicBool::new(true),
            disconnect_fired: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnect_cancel: Mutex::new(None),
            handler: Mutex::new(None),
        })
    }

    pub(crate) fn set_handler(&self, handler: Weak<dyn ConnectionHandler>) {
        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&self, new_state: ConnectionState) {
        let old = self.state_tx.send_replace(new_state);
        if old != new_state {
            debug!(?old, new = ?new_state, "connection state changed");
        }
    }

    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn enable_reconnect(&self) {
        self.reconnect_enabled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disable_reconnect(&self) {
        self.reconnect_enabled.store(false, Ordering::SeqCst);
    }

    /// Opens the transport.
    ///
    /// A failed initial handshake is returned to the caller and never
    /// triggers the reconnect loop.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        cancel_reconnect(&self.reconnect_cancel);
        self.enable_reconnect();

        if self.state() == ConnectionState::Connected && self.transport.is_open() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match self.transport.open().await {
            Ok(events) => {
                self.set_state(ConnectionState::Connected);
                self.start_episode(events);
                info!("connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(match e {
                    TransportError::Handshake(reason) => ConnectionError::HandshakeFailed(reason),
                    other => ConnectionError::HandshakeFailed(other.to_string()),
                })
            }
        }
    }

    /// Closes the transport and disables auto-reconnect. Idempotent.
    pub(crate) async fn close(&self) {
        self.disable_reconnect();
        cancel_reconnect(&self.reconnect_cancel);
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Sends one text frame on the open socket.
    pub(crate) async fn send(&self, text: String) -> Result<(), ConnectionError> {
        if !self.transport.is_open() {
            return Err(ConnectionError::NotConnected);
        }
        trace!(len = text.len(), "sending");
        self.transport.send(text).await.map_err(Into::into)
    }

    /// Drops the socket without disabling auto-reconnect.
    pub(crate) async fn abort(&self) {
        warn!("dropping connection");
        self.transport.close().await;
    }

    /// Starts the read loop for a freshly opened socket.
    pub(crate) fn start_episode(self: &Arc<Self>, events: mpsc::Receiver<TransportEvent>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.disconnect_fired.store(false, Ordering::SeqCst);
        tokio::spawn(read_loop(Arc::downgrade(self), generation, events));
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(generation, "ignoring close from stale connection");
            return;
        }

        info!(code, reason, "connection closed");
        if !self.disconnect_fired.swap(true, Ordering::SeqCst)
            && let Some(handler) = self.handler()
            && let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_disconnected(code, reason)))
        {
            error!(message = %panic_message(payload.as_ref()), "disconnect handler panicked");
        }

        match &self.policy {
            Some(policy) if self.reconnect_enabled() => {
                let cancel = CancellationToken::new();
                cancel_reconnect(&self.reconnect_cancel);
                if let Ok(mut guard) = self.reconnect_cancel.lock() {
                    *guard = Some(cancel.clone());
                }
                self.set_state(ConnectionState::Reconnecting { attempt: 1 });
                tokio::spawn(reconnect_loop(
                    Arc::downgrade(self),
                    policy.clone(),
                    cancel,
                ));
            }
            _ => self.set_state(ConnectionState::Disconnected),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        cancel_reconnect(&self.reconnect_cancel);
    }
}

/// Processes one socket's events in arrival order.
///
/// While a message is being handled the socket keeps being read: frames the
/// handler accepts through `on_response` are consumed at once, everything
/// else waits in `backlog` and is handled afterwards in order.
async fn read_loop(
    manager: Weak<ConnectionManager>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    let mut backlog = VecDeque::new();
    let mut ended = false;

    loop {
        let event = match backlog.pop_front() {
            Some(event) => event,
            None if ended => break,
            None => match events.recv().await {
                Some(event) => event,
                None => break,
            },
        };
        let Some(this) = manager.upgrade() else {
            return;
        };
        if this.generation.load(Ordering::SeqCst) != generation {
            trace!(generation, "read loop superseded");
            return;
        }
        match event {
            TransportEvent::Message(text) => {
                let Some(handler) = this.handler() else {
                    continue;
                };
                let handling = AssertUnwindSafe(handler.on_message(text)).catch_unwind();
                tokio::pin!(handling);
                loop {
                    tokio::select! {
                        biased;
                        outcome = &mut handling => {
                            if let Err(payload) = outcome {
                                error!(
                                    message = %panic_message(payload.as_ref()),
                                    "message handler panicked"
                                );
                            }
                            break;
                        }
                        next = events.recv(), if !ended => match next {
                            Some(TransportEvent::Message(text)) if handler.on_response(&text) => {}
                            Some(event) => backlog.push_back(event),
                            None => ended = true,
                        },
                    }
                }
            }
            TransportEvent::Closed { code, reason } => {
                this.handle_close(generation, code, &reason);
                return;
            }
        }
    }

    // Event stream ended without a close event.
    if let Some(this) = manager.upgrade() {
        this.handle_close(generation, CLOSE_ABNORMAL, "transport ended");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::transport::mock::MockTransport;

    /// Records everything the manager reports.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub messages: Mutex<Vec<String>>,
        pub disconnects: Mutex<Vec<(u16, String)>>,
        pub reconnects: AtomicU64,
    }

    impl ConnectionHandler for RecordingHandler {
        fn on_message(&self, text: String) -> HandlerFuture<'_> {
            Box::pin(async move {
                self.messages.lock().unwrap().push(text);
            })
        }

        fn on_disconnected(&self, code: u16, reason: &str) {
            self.disconnects
                .lock()
                .unwrap()
                .push((code, reason.to_string()));
        }

        fn on_reconnected(&self) -> HandlerFuture<'_> {
            Box::pin(async move {
                self.reconnects.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn setup(
        policy: Option<ReconnectPolicy>,
    ) -> (Arc<ConnectionManager>, MockTransport, Arc<RecordingHandler>) {
        let transport = MockTransport::new();
        let manager = ConnectionManager::new(Arc::new(transport.clone()), policy);
        let handler = Arc::new(RecordingHandler::default());
        let weak: Weak<RecordingHandler> = Arc::downgrade(&handler);
        manager.set_handler(weak);
        (manager, transport, handler)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn connect_reaches_connected() {
        let (manager, transport, _) = setup(None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_connect_does_not_reconnect() {
        let (manager, transport, _) = setup(Some(ReconnectPolicy::default()));
        transport.fail_opens(1);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::HandshakeFailed(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn send_requires_open_socket() {
        let (manager, _, _) = setup(None);
        assert_eq!(
            manager.send("{}".into()).await,
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn messages_reach_handler_in_order() {
        let (manager, transport, handler) = setup(None);
        manager.connect().await.unwrap();

        transport.inject(json!({"n": 1})).await;
        transport.inject(json!({"n": 2})).await;
        settle().await;

        let messages = handler.messages.lock().unwrap().clone();
        assert_eq!(messages, vec![r#"{"n":1}"#, r#"{"n":2}"#]);
    }

    /// Panics on `"boom"`; holds `"hold"` until a response frame is offered.
    #[derive(Default)]
    struct PickyHandler {
        messages: Mutex<Vec<String>>,
        responses: Mutex<Vec<String>>,
        released: tokio::sync::Notify,
    }

    impl ConnectionHandler for PickyHandler {
        fn on_message(&self, text: String) -> HandlerFuture<'_> {
            Box::pin(async move {
                if text.contains("boom") {
                    panic!("handler bug");
                }
                if text.contains("hold") {
                    self.released.notified().await;
                }
                self.messages.lock().unwrap().push(text);
            })
        }

        fn on_response(&self, text: &str) -> bool {
            if !text.contains("result") {
                return false;
            }
            self.responses.lock().unwrap().push(text.to_string());
            self.released.notify_one();
            true
        }

        fn on_disconnected(&self, _code: u16, _reason: &str) {}

        fn on_reconnected(&self) -> HandlerFuture<'_> {
            Box::pin(async {})
        }
    }

    fn setup_picky() -> (Arc<ConnectionManager>, MockTransport, Arc<PickyHandler>) {
        let transport = MockTransport::new();
        let manager = ConnectionManager::new(Arc::new(transport.clone()), None);
        let handler = Arc::new(PickyHandler::default());
        let weak: Weak<PickyHandler> = Arc::downgrade(&handler);
        manager.set_handler(weak);
        (manager, transport, handler)
    }

    #[tokio::test]
    async fn panicking_handler_keeps_read_loop_alive() {
        let (manager, transport, handler) = setup_picky();
        manager.connect().await.unwrap();

        transport.inject(json!({"n": "boom"})).await;
        transport.inject(json!({"n": 2})).await;
        settle().await;
        assert_eq!(*handler.messages.lock().unwrap(), vec![r#"{"n":2}"#]);

        transport.drop_connection(1006, "gone").await;
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn responses_bypass_a_running_message() {
        let (manager, transport, handler) = setup_picky();
        manager.connect().await.unwrap();

        transport.inject(json!({"n": "hold"})).await;
        transport.inject(json!({"n": "next"})).await;
        transport.inject(json!({"id": 1, "result": 0})).await;
        settle().await;

        assert_eq!(
            *handler.responses.lock().unwrap(),
            vec![r#"{"id":1,"result":0}"#]
        );
        assert_eq!(
            *handler.messages.lock().unwrap(),
            vec![r#"{"n":"hold"}"#, r#"{"n":"next"}"#]
        );
    }

    #[tokio::test]
    async fn drop_without_policy_is_terminal() {
        let (manager, transport, handler) = setup(None);
        manager.connect().await.unwrap();

        transport.drop_connection(1006, "gone").await;
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            *handler.disconnects.lock().unwrap(),
            vec![(1006, "gone".to_string())]
        );
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_with_policy_reconnects_after_backoff() {
        let (manager, transport, handler) = setup(Some(ReconnectPolicy::default()));
        manager.connect().await.unwrap();

        transport.drop_connection(1006, "gone").await;
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(transport.open_count(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.open_count(), 2);
        assert_eq!(handler.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(handler.disconnects.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_failed_attempts() {
        let (manager, transport, handler) = setup(Some(ReconnectPolicy::default()));
        manager.connect().await.unwrap();
        transport.fail_opens(2);

        transport.drop_connection(1006, "gone").await;
        // Attempts at t=1s, t=3s and t=7s; the third succeeds.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 2 });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.open_count(), 3);
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 3 });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.open_count(), 4);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(handler.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_gives_up() {
        let (manager, transport, handler) =
            setup(Some(ReconnectPolicy::default().with_max_attempts(1)));
        manager.connect().await.unwrap();
        transport.fail_opens(1);

        transport.drop_connection(1006, "gone").await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(manager.state(), ConnectionState::GivenUp);
        assert_eq!(transport.open_count(), 2);
        assert_eq!(handler.disconnects.lock().unwrap().len(), 1);
        assert_eq!(handler.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_reset_after_successful_reconnect() {
        let (manager, transport, handler) =
            setup(Some(ReconnectPolicy::default().with_max_attempts(2)));
        manager.connect().await.unwrap();

        transport.fail_opens(1);
        transport.drop_connection(1006, "first").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        transport.fail_opens(1);
        transport.drop_connection(1006, "second").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(handler.reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(handler.disconnects.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_reconnect_never_schedules_attempts() {
        let (manager, transport, _) = setup(Some(ReconnectPolicy::default()));
        manager.connect().await.unwrap();
        manager.disable_reconnect();

        transport.drop_connection(1006, "gone").await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let (manager, transport, _) = setup(Some(ReconnectPolicy::default()));
        manager.connect().await.unwrap();

        transport.drop_connection(1006, "gone").await;
        settle().await;
        manager.close().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reports_once() {
        let (manager, transport, handler) = setup(Some(ReconnectPolicy::default()));
        manager.connect().await.unwrap();

        manager.close().await;
        manager.close().await;
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!transport.is_open());
        assert_eq!(handler.disconnects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let (manager, _, _) = setup(None);
        let mut rx = manager.watch_state();
        manager.connect().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }
}
