//! Kolibri consumer client.
//!
//! [`Client`] ties the pieces together: the [`ConnectionManager`] owns the
//! socket, the [`RequestCorrelator`] turns responses back into awaited
//! results, and the [`Dispatcher`] answers calls the broker makes into the
//! client. After a transparent reconnect the session is restored from
//! [`SessionState`] before the application's reconnect listener runs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use kolibri_protocol::Request;
use kolibri_protocol::messages::{
    LoginParams, LoginResult, ReadParams, SubscribeParams, TransactionParams, UnsubscribeParams,
    WriteNode, WriteParams,
};
use kolibri_protocol::methods;

use crate::config::ClientConfig;
use crate::correlator::RequestCorrelator;
use crate::dispatcher::{BoxError, Dispatcher, RpcFuture, RpcHandler};
use crate::error::{ClientError, ConnectionError};
use crate::listeners::Listeners;
use crate::manager::{ConnectionHandler, ConnectionManager, HandlerFuture};
use crate::session::SessionState;
use crate::subscription::SubscriptionCache;
use crate::transport::{Transport, WsTransport};
use crate::types::ConnectionState;
use crate::write::{WriteMode, classify};

/// A persistent connection to a Kolibri broker.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    manager: Arc<ConnectionManager>,
    correlator: RequestCorrelator,
    dispatcher: Dispatcher,
    cache: SubscriptionCache,
    session: SessionState,
    listeners: Listeners,
    next_tid: AtomicU64,
}

impl Client {
    /// Creates a client connecting over WebSocket to the configured endpoint.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = WsTransport::from_endpoint(&config.endpoint, config.ws_config())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Creates a client over a caller-provided transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let manager = ConnectionManager::new(transport, config.reconnect.clone());
        let correlator = RequestCorrelator::new();
        let cache = SubscriptionCache::new();
        let listeners = Listeners::default();
        let dispatcher = Dispatcher::new(
            manager.clone(),
            correlator.clone(),
            cache.clone(),
            listeners.clone(),
        );

        let inner = Arc::new(ClientInner {
            session: SessionState::new(config.auth.clone()),
            config,
            manager,
            correlator,
            dispatcher,
            cache,
            listeners,
            next_tid: AtomicU64::new(1),
        });
        let handler: Weak<ClientInner> = Arc::downgrade(&inner);
        inner.manager.set_handler(handler);
        Self { inner }
    }

    /// Opens the connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.manager.connect().await?;
        Ok(())
    }

    /// Closes the connection for good.
    ///
    /// Disables auto-reconnect, rejects in-flight requests, restarts request
    /// and transaction ids at 1 and drops staged write batches.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manager.close().await;
        inner.correlator.reset(ConnectionError::Closed);
        inner.next_tid.store(1, Ordering::SeqCst);
        inner.dispatcher.clear_pending_writes();
        info!("disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.manager.watch_state()
    }

    /// Sends a request and waits for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.inner.request(method, params, None).await
    }

    /// Calls a custom RPC registered by another client, routed through the
    /// broker to `server`.
    pub async fn call_rpc(
        &self,
        server: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.inner
            .request(method, params, Some(Value::from(server)))
            .await
    }

    /// Registers a handler for a custom RPC. Replaces any earlier handler for
    /// the same method.
    ///
    /// A handler may await requests on this same client. An `Err` or a panic
    /// is answered with an error response; if the response cannot be sent
    /// the error listener receives [`ClientError::ResponseNotSent`] and the
    /// connection is dropped.
    pub fn register_rpc<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let handler: RpcHandler =
            Arc::new(move |params: Option<Value>| Box::pin(handler(params)) as RpcFuture);
        self.inner.dispatcher.register(method, handler);
    }

    /// Logs in. Configured auth takes precedence over `params`.
    pub async fn login(&self, params: Option<LoginParams>) -> Result<LoginResult, ClientError> {
        let params = self
            .inner
            .config
            .auth
            .clone()
            .or(params)
            .ok_or(ClientError::MissingAuth)?;
        self.inner.login_with(params).await
    }

    pub async fn logout(&self) -> Result<Value, ClientError> {
        self.inner.request(methods::LOGOUT, None, None).await
    }

    /// Replaces the access token of the current session.
    pub async fn update_token(&self, params: Value) -> Result<Value, ClientError> {
        self.inner
            .request(methods::UPDATE_TOKEN, Some(params), None)
            .await
    }

    /// Asks the broker to close the session. Auto-reconnect is disabled
    /// before the request is sent.
    pub async fn close(&self) -> Result<Value, ClientError> {
        self.inner.manager.disable_reconnect();
        self.inner.request(methods::CLOSE, None, None).await
    }

    pub async fn read(&self, params: Vec<ReadParams>) -> Result<Vec<Value>, ClientError> {
        self.inner.typed_request(methods::READ, &params).await
    }

    /// Writes node values.
    ///
    /// Quality 0–2 nodes take one round trip. Quality 3–4 nodes are staged
    /// under a fresh transaction id and committed; if staging or commit
    /// fails the transaction is cancelled and the first error returned.
    pub async fn write(&self, nodes: Vec<WriteNode>) -> Result<Value, ClientError> {
        let inner = &self.inner;
        match classify(&nodes)? {
            WriteMode::Immediate => {
                let params = WriteParams { nodes, tid: None };
                inner.typed_request(methods::WRITE, &params).await
            }
            WriteMode::Transactional => {
                let tid = inner.next_tid.fetch_add(1, Ordering::SeqCst);
                let params = WriteParams {
                    nodes,
                    tid: Some(tid),
                };
                let tx = TransactionParams { tid };

                let staged = async {
                    let result: Value = inner.typed_request(methods::WRITE, &params).await?;
                    let _: Value = inner.typed_request(methods::COMMIT, &tx).await?;
                    Ok::<_, ClientError>(result)
                }
                .await;

                match staged {
                    Ok(result) => Ok(result),
                    Err(e) => {
                        warn!(tid, error = %e, "transactional write failed, cancelling");
                        match inner.typed_request::<_, Value>(methods::CANCEL, &tx).await {
                            Ok(_) => Err(e),
                            Err(cancel_err) => Err(cancel_err),
                        }
                    }
                }
            }
        }
    }

    /// Subscribes to nodes and caches their properties.
    pub async fn subscribe(&self, params: Vec<SubscribeParams>) -> Result<Vec<Value>, ClientError> {
        let value = serde_json::to_value(&params)?;
        self.inner.subscribe_value(value).await
    }

    pub async fn unsubscribe(&self, params: Vec<UnsubscribeParams>) -> Result<Value, ClientError> {
        let inner = &self.inner;
        let result: Value = inner.typed_request(methods::UNSUBSCRIBE, &params).await?;
        inner.cache.remove(params.iter().map(|p| p.path.as_str()));
        inner.session.clear_subscribe();
        Ok(result)
    }

    pub async fn user_subscribe(&self, params: Vec<Value>) -> Result<Value, ClientError> {
        self.inner.user_subscribe_value(Value::from(params)).await
    }

    pub async fn user_unsubscribe(&self, params: Vec<Value>) -> Result<Value, ClientError> {
        let inner = &self.inner;
        let result = inner
            .request(methods::USER_UNSUBSCRIBE, Some(Value::from(params)), None)
            .await?;
        inner.session.clear_user_subscribe();
        Ok(result)
    }

    /// Called after a reconnect once the session has been restored.
    pub fn on_reconnect<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.listeners.set_reconnect(Arc::new(f));
    }

    /// Called with the close code and reason whenever the connection drops.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.inner.listeners.set_disconnect(Arc::new(f));
    }

    /// Called with merged node records for every write notification.
    pub fn on_write<F>(&self, f: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.inner.listeners.set_write(Arc::new(f));
    }

    pub fn on_unsubscribed<F>(&self, f: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.listeners.set_unsubscribed(Arc::new(f));
    }

    pub fn on_user_notify<F>(&self, f: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.listeners.set_user_notify(Arc::new(f));
    }

    /// Called with failures that happen after a broker call was acknowledged
    /// and with responses that could not be sent.
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.inner.listeners.set_error(Arc::new(f));
    }
}

impl ClientInner {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        server: Option<Value>,
    ) -> Result<Value, ClientError> {
        // Dropping this future (a caller-side timeout or `select!`) releases
        // the pending entry through the guard.
        let (pending, rx) = self.correlator.issue_guarded();
        let id = pending.id();
        self.transmit(id, method, params, server).await?;

        let outcome = match self.config.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(id, method, "request timed out");
                    self.correlator.fail(id, ClientError::Timeout);
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or(Err(ClientError::Connection(ConnectionError::Closed)))
    }

    async fn transmit(
        &self,
        id: u64,
        method: &str,
        params: Option<Value>,
        server: Option<Value>,
    ) -> Result<(), ClientError> {
        let mut request = Request::new(id, method, params.as_ref())?;
        if let Some(server) = server {
            request = request.with_server(server);
        }
        let text = serde_json::to_string(&request)?;
        self.manager.send(text).await?;
        Ok(())
    }

    async fn typed_request<P, R>(&self, method: &str, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, Some(params), None).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn login_with(&self, params: LoginParams) -> Result<LoginResult, ClientError> {
        let result: LoginResult = self.typed_request(methods::LOGIN, &params).await?;
        self.session.store_login(params, result.clone());
        Ok(result)
    }

    async fn subscribe_value(&self, params: Value) -> Result<Vec<Value>, ClientError> {
        let result = self
            .request(methods::SUBSCRIBE, Some(params.clone()), None)
            .await?;
        let Value::Array(rows) = &result else {
            return Err(ClientError::UnexpectedResponse(format!(
                "subscribe result is not an array: {result}"
            )));
        };
        let rows = rows.clone();
        self.cache.store(&rows);
        self.session.store_subscribe(params, result);
        Ok(rows)
    }

    async fn user_subscribe_value(&self, params: Value) -> Result<Value, ClientError> {
        let result = self
            .request(methods::USER_SUBSCRIBE, Some(params.clone()), None)
            .await?;
        self.session.store_user_subscribe(params, result.clone());
        Ok(result)
    }

    /// Re-authenticates and, if the policy asks for it, resumes subscriptions.
    async fn restore_session(&self) -> Result<(), ClientError> {
        let login = self.session.login_to_restore()?;
        self.login_with(login).await?;

        let resume = self
            .config
            .reconnect
            .as_ref()
            .is_some_and(|p| p.resume_subscriptions);
        if resume {
            if let Some(params) = self.session.subscribe_to_restore() {
                self.subscribe_value(params).await?;
            }
            if let Some(params) = self.session.user_subscribe_to_restore() {
                self.user_subscribe_value(params).await?;
            }
        }
        Ok(())
    }
}

impl ConnectionHandler for ClientInner {
    fn on_message(&self, text: String) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.dispatcher.dispatch(&text).await;
        })
    }

    fn on_response(&self, text: &str) -> bool {
        self.dispatcher.try_complete(text)
    }

    fn on_disconnected(&self, code: u16, reason: &str) {
        self.correlator.fail_all(ConnectionError::Closed);
        self.listeners.disconnected(code, reason);
    }

    fn on_reconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.restore_session().await {
                Ok(()) => {
                    info!("session restored");
                    self.listeners.reconnected();
                }
                Err(e) => warn!(error = %e, "restoring session after reconnect failed"),
            }
        })
    }
}
