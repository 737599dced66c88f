//! Routing of inbound messages.
//!
//! Every inbound frame is classified and handled in arrival order:
//!
//! 1. a response is handed to the [`RequestCorrelator`];
//! 2. a consumer method (`kolibri.write`, `kolibri.unsubscribed`,
//!    `kolibri.user.notify`, `kolibri.commit`) goes to its built-in handler;
//! 3. a registered custom method is invoked and its result sent back;
//! 4. anything else is answered with "method not found".
//!
//! Requests carrying an id always get exactly one response. A custom
//! handler that panics is answered with a generic processing error.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use kolibri_protocol::messages::{NodePath, TransactionParams, WriteNotifyParams};
use kolibri_protocol::methods::{COMMIT, GET_RPC_INFO, UNSUBSCRIBED, USER_NOTIFY, WRITE};
use kolibri_protocol::{ErrorKind, Incoming, Request, Response, RpcError};

use crate::correlator::RequestCorrelator;
use crate::error::{ClientError, ProtocolError};
use crate::listeners::{Listeners, panic_message};
use crate::manager::ConnectionManager;
use crate::subscription::SubscriptionCache;

/// Error type custom RPC handlers may fail with.
///
/// An [`RpcError`] or [`ProtocolError`] is sent to the caller unchanged; any
/// other error becomes a generic Kolibri RPC error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A boxed future returned by custom RPC handlers.
pub type RpcFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send>>;

/// A custom RPC handler. Receives the call's params.
pub type RpcHandler = Arc<dyn Fn(Option<Value>) -> RpcFuture + Send + Sync>;

type Registry = Arc<RwLock<HashMap<String, RpcHandler>>>;

pub(crate) struct Dispatcher {
    manager: Arc<ConnectionManager>,
    correlator: RequestCorrelator,
    cache: SubscriptionCache,
    listeners: Listeners,
    registry: Registry,
    /// Merged write batches staged under a transaction id, awaiting commit.
    pending_writes: Mutex<HashMap<u64, Vec<Value>>>,
}

impl Dispatcher {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        correlator: RequestCorrelator,
        cache: SubscriptionCache,
        listeners: Listeners,
    ) -> Self {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let dispatcher = Self {
            manager,
            correlator,
            cache,
            listeners,
            registry,
            pending_writes: Mutex::new(HashMap::new()),
        };
        dispatcher.register(GET_RPC_INFO, rpc_info_handler(Arc::downgrade(&dispatcher.registry)));
        dispatcher
    }

    /// Registers (or replaces) a custom RPC handler.
    pub(crate) fn register(&self, method: impl Into<String>, handler: RpcHandler) {
        let method = method.into();
        debug!(%method, "registering custom RPC");
        self.registry
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(method, handler);
    }

    fn handler_for(&self, method: &str) -> Option<RpcHandler> {
        self.registry
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(method)
            .cloned()
    }

    /// Drops every staged write batch.
    pub(crate) fn clear_pending_writes(&self) {
        self.pending_writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Handles one inbound text frame.
    pub(crate) async fn dispatch(&self, text: &str) {
        match Incoming::parse(text) {
            Ok(Incoming::Response(resp)) => self.on_response(resp),
            Ok(Incoming::Request(req)) => self.on_request(req).await,
            Err(e) => warn!(error = %e, "dropping unparseable message"),
        }
    }

    /// Completes `text` right away if it is a response; returns `false` for
    /// anything else.
    pub(crate) fn try_complete(&self, text: &str) -> bool {
        match Incoming::parse(text) {
            Ok(Incoming::Response(resp)) => {
                self.on_response(resp);
                true
            }
            _ => false,
        }
    }

    fn on_response(&self, resp: Response) {
        let Some(id) = resp.numeric_id() else {
            warn!(id = %resp.id, "dropping response with non-numeric id");
            return;
        };
        if !self.correlator.complete(id, resp.into_result()) {
            debug!(id, "no pending request for response, dropping");
        }
    }

    async fn on_request(&self, req: Request) {
        trace!(method = %req.method, "inbound request");
        match req.method.as_str() {
            WRITE => self.on_write_notify(req).await,
            UNSUBSCRIBED => self.on_unsubscribed(req).await,
            USER_NOTIFY => self.on_user_notify(req).await,
            COMMIT => self.on_commit(req).await,
            _ => self.on_custom(req).await,
        }
    }

    async fn send_response(&self, resp: Option<Response>) -> Result<(), ClientError> {
        let Some(resp) = resp else {
            return Ok(());
        };
        let text = serde_json::to_string(&resp)?;
        self.manager.send(text).await?;
        Ok(())
    }

    /// Sends the zero-result acknowledgment for a consumer call.
    async fn ack(&self, req: &Request) -> Result<(), ClientError> {
        self.send_response(req.reply(Value::from(0))).await
    }

    /// Parses consumer params, answering malformed ones with an
    /// invalid-parameter error.
    async fn consumer_params<T: serde::de::DeserializeOwned>(&self, req: &Request) -> Option<T> {
        let problem = match req.parse_params::<T>() {
            Ok(Some(params)) => return Some(params),
            Ok(None) => "missing params".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(method = %req.method, %problem, "malformed consumer params");
        let err = RpcError::new(ErrorKind::InvalidParameter).with_data(problem);
        if let Err(e) = self.send_response(req.reply_error(err)).await {
            self.listeners.error(&e);
        }
        None
    }

    async fn on_write_notify(&self, req: Request) {
        let Some(params) = self.consumer_params::<WriteNotifyParams>(&req).await else {
            return;
        };
        let merged: Vec<Value> = params
            .nodes
            .iter()
            .filter_map(|change| self.cache.merge(change))
            .map(Value::Object)
            .collect();

        // tid 0 is not a transaction.
        if let Some(tid) = params.tid.filter(|&tid| tid != 0) {
            trace!(tid, nodes = merged.len(), "staging write batch");
            self.pending_writes
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(tid, merged);
            if let Err(e) = self.ack(&req).await {
                self.listeners.error(&e);
            }
            return;
        }

        if let Err(e) = self.ack(&req).await {
            self.listeners.error(&e);
            return;
        }
        if !merged.is_empty() {
            self.listeners.write(merged);
        }
    }

    async fn on_unsubscribed(&self, req: Request) {
        let Some(nodes) = self.consumer_params::<Vec<NodePath>>(&req).await else {
            return;
        };
        self.cache.remove(nodes.iter().map(|n| n.path.as_str()));

        if let Err(e) = self.ack(&req).await {
            self.listeners.error(&e);
            return;
        }
        self.listeners
            .unsubscribed(req.params.unwrap_or(Value::Null));
    }

    async fn on_user_notify(&self, req: Request) {
        if let Err(e) = self.ack(&req).await {
            self.listeners.error(&e);
            return;
        }
        self.listeners.user_notify(req.params.unwrap_or(Value::Null));
    }

    async fn on_commit(&self, req: Request) {
        let Some(TransactionParams { tid }) = self.consumer_params::<TransactionParams>(&req).await
        else {
            return;
        };
        let batch = self
            .pending_writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&tid);

        let acked = self.ack(&req).await;
        match (acked, batch) {
            (Err(e), _) => self.listeners.error(&e),
            (Ok(()), Some(batch)) => self.listeners.write(batch),
            (Ok(()), None) => debug!(tid, "commit for unknown transaction"),
        }
    }

    async fn on_custom(&self, req: Request) {
        let Some(handler) = self.handler_for(&req.method) else {
            debug!(method = %req.method, "no handler registered");
            let err = rpc_error_from(Box::new(ClientError::MethodNotFound(req.method.clone())));
            self.respond(&req, req.reply_error(err)).await;
            return;
        };

        let params = req.params.clone();
        let call = AssertUnwindSafe(async move { handler(params).await }).catch_unwind();
        let response = match call.await {
            Ok(Ok(result)) => req.reply(result),
            Ok(Err(e)) => req.reply_error(rpc_error_from(e)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(method = %req.method, %message, "custom RPC handler panicked");
                self.listeners.error(&ClientError::Panicked {
                    context: format!("handler for {}", req.method),
                    message,
                });
                req.reply_error(RpcError::new(ErrorKind::RpcProcessing))
            }
        };
        self.respond(&req, response).await;
    }

    /// Sends the answer to a custom call.
    ///
    /// The caller cannot be told when this fails, so the failure is reported
    /// as undeliverable and the socket is dropped; an unanswered call leaves
    /// the session in an unknown state.
    async fn respond(&self, req: &Request, response: Option<Response>) {
        let Err(e) = self.send_response(response).await else {
            return;
        };
        error!(method = %req.method, error = %e, "failed to send custom RPC response");
        self.listeners.error(&ClientError::ResponseNotSent {
            method: req.method.clone(),
            source: Box::new(e),
        });
        self.manager.abort().await;
    }
}

/// Maps a handler failure onto the error object sent to the caller.
fn rpc_error_from(err: BoxError) -> RpcError {
    let err = match err.downcast::<RpcError>() {
        Ok(rpc) => return *rpc,
        Err(other) => other,
    };
    let err = match err.downcast::<ProtocolError>() {
        Ok(protocol) => return (*protocol).into(),
        Err(other) => other,
    };
    match err.downcast::<ClientError>() {
        Ok(client) => match *client {
            ClientError::Protocol(protocol) => protocol.into(),
            ClientError::MethodNotFound(method) => {
                RpcError::new(ErrorKind::MethodNotFound).with_data(method)
            }
            other => {
                debug!(error = %other, "custom RPC failed");
                RpcError::new(ErrorKind::RpcProcessing)
            }
        },
        Err(other) => {
            debug!(error = %other, "custom RPC failed");
            RpcError::new(ErrorKind::RpcProcessing)
        }
    }
}

/// `kolibri.getRpcInfo`: lists the registered custom methods.
fn rpc_info_handler(registry: Weak<RwLock<HashMap<String, RpcHandler>>>) -> RpcHandler {
    Arc::new(move |_params: Option<Value>| -> RpcFuture {
        let registry = registry.clone();
        Box::pin(async move {
            let mut methods: Vec<String> = match registry.upgrade() {
                Some(registry) => registry
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .keys()
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            methods.sort();
            Ok(Value::from(methods))
        })
    })
}
