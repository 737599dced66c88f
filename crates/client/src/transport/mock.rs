//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportEvent, TransportFuture};

type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

#[derive(Default)]
struct MockState {
    events_tx: Option<mpsc::Sender<TransportEvent>>,
    open_results: VecDeque<Result<(), TransportError>>,
    sent: Vec<Value>,
    responder: Option<Responder>,
}

/// A transport whose peer is the test itself.
///
/// Opens succeed unless a failure was queued with [`MockTransport::fail_opens`].
/// Outbound requests are recorded and, when a responder is installed, answered
/// by injecting whatever the responder returns.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
    opens: Arc<AtomicUsize>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `n` failing opens ahead of any later successful ones.
    pub(crate) fn fail_opens(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            state
                .open_results
                .push_back(Err(TransportError::Handshake("refused".into())));
        }
    }

    /// Installs an automatic peer: called for every outbound request,
    /// a returned value is delivered back as an inbound message.
    pub(crate) fn respond_with<F>(&self, f: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().responder = Some(Arc::new(f));
    }

    /// Delivers an inbound message on the open socket.
    pub(crate) async fn inject(&self, msg: Value) {
        let tx = self.state.lock().unwrap().events_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Message(msg.to_string())).await;
        }
    }

    /// Simulates the peer dropping the connection.
    pub(crate) async fn drop_connection(&self, code: u16, reason: &str) {
        let tx = self.state.lock().unwrap().events_tx.take();
        if let Some(tx) = tx {
            let _ = tx
                .send(TransportEvent::Closed {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Every message sent so far, parsed.
    pub(crate) fn sent(&self) -> Vec<Value> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Sent messages that are requests for `method`.
    pub(crate) fn sent_requests(&self, method: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .collect()
    }

    /// Sent messages that are responses (carry no method).
    pub(crate) fn sent_responses(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m.get("method").is_none())
            .collect()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn open(&self) -> TransportFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().unwrap();
            if let Some(Err(e)) = state.open_results.pop_front() {
                return Err(e);
            }
            let (tx, rx) = mpsc::channel(64);
            state.events_tx = Some(tx);
            Ok(rx)
        })
    }

    fn send(&self, text: String) -> TransportFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let value: Value = serde_json::from_str(&text).expect("client sends JSON");
            let (tx, reply) = {
                let mut state = self.state.lock().unwrap();
                let Some(tx) = state.events_tx.clone() else {
                    return Err(TransportError::NotOpen);
                };
                state.sent.push(value.clone());
                let reply = match (&state.responder, value.get("method")) {
                    (Some(responder), Some(_)) => responder(&value),
                    _ => None,
                };
                (tx, reply)
            };
            if let Some(reply) = reply {
                let _ = tx.send(TransportEvent::Message(reply.to_string())).await;
            }
            Ok(())
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let tx = self.state.lock().unwrap().events_tx.take();
            if let Some(tx) = tx {
                let _ = tx
                    .send(TransportEvent::Closed {
                        code: super::CLOSE_NORMAL,
                        reason: "closed by client".into(),
                    })
                    .await;
            }
        })
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().events_tx.is_some()
    }
}

/// A responder that answers every request with `result` and echoes its id.
pub(crate) fn reply_all(result: Value) -> impl Fn(&Value) -> Option<Value> + Send + Sync {
    move |req| {
        let id = req.get("id")?;
        Some(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}
