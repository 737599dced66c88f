//! WebSocket transport to a Kolibri broker.
//!
//! Each [`Transport::open`] performs a fresh handshake (negotiating the
//! Kolibri subprotocol, through a proxy tunnel and with custom TLS settings
//! when configured) and spawns read, write and ping pumps for the socket.
//! [`Transport::close`] cancels the pumps; the read pump then reports the
//! final close event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::{Connector, tungstenite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::proxy::HttpProxy;
use super::{Transport, TransportError, TransportEvent, TransportFuture};
use crate::config::Endpoint;
use crate::error::ClientError;

/// Interval between keepalive pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(30);

/// Time without any inbound frame before the socket is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Largest accepted inbound message.
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const CHANNEL_CAPACITY: usize = 256;

/// Socket-level tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsConfig {
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub max_message_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_period: WS_PING_PERIOD,
            pong_wait: WS_PONG_WAIT,
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

/// Live state of one open socket.
struct WsLink {
    write_tx: mpsc::Sender<tungstenite::Message>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WsLink {
    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// [`Transport`] over `tokio-tungstenite`.
pub struct WsTransport {
    url: Url,
    subprotocol: String,
    config: WsConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    proxy: Option<HttpProxy>,
    link: Mutex<Option<WsLink>>,
}

impl WsTransport {
    pub fn new(url: Url, subprotocol: impl Into<String>) -> Self {
        Self::with_config(url, subprotocol, WsConfig::default())
    }

    pub fn with_config(url: Url, subprotocol: impl Into<String>, config: WsConfig) -> Self {
        Self {
            url,
            subprotocol: subprotocol.into(),
            config,
            tls: None,
            proxy: None,
            link: Mutex::new(None),
        }
    }

    /// Builds the transport for `endpoint`, loading its TLS material and
    /// validating its proxy up front.
    pub fn from_endpoint(endpoint: &Endpoint, config: WsConfig) -> Result<Self, ClientError> {
        let mut transport =
            Self::with_config(endpoint.url()?, endpoint.subprotocol.clone(), config);
        if let Some(tls) = &endpoint.tls {
            transport.tls = Some(super::tls::client_config(tls)?);
        }
        if let Some(proxy) = &endpoint.proxy {
            transport.proxy = Some(HttpProxy::from_options(proxy)?);
        }
        Ok(transport)
    }

    /// `host:port` of the broker, as a proxy tunnel target.
    fn authority(&self) -> Result<String, TransportError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| TransportError::Handshake(format!("{}: missing host", self.url)))?;
        let port = self.url.port_or_known_default().unwrap_or(80);
        Ok(format!("{host}:{port}"))
    }

    fn current_link(&self) -> Option<(mpsc::Sender<tungstenite::Message>, Arc<AtomicBool>)> {
        let guard = self.link.lock().ok()?;
        guard
            .as_ref()
            .map(|link| (link.write_tx.clone(), link.open.clone()))
    }

    fn replace_link(&self, link: Option<WsLink>) {
        let previous = match self.link.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, link),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), link),
        };
        if let Some(previous) = previous {
            previous.shutdown();
        }
    }

    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        // A reopen always starts from a clean socket.
        self.replace_link(None);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        if !self.subprotocol.is_empty() {
            let value = HeaderValue::from_str(&self.subprotocol)
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);

        let connector = self.tls.clone().map(Connector::Rustls);
        debug!(url = %self.url, proxied = self.proxy.is_some(), "opening WebSocket");
        let handshake = match &self.proxy {
            Some(proxy) => {
                let stream = proxy.tunnel(&self.authority()?).await?;
                tokio_tungstenite::client_async_tls_with_config(
                    request,
                    stream,
                    Some(ws_config),
                    connector,
                )
                .await
            }
            None => {
                tokio_tungstenite::connect_async_tls_with_config(
                    request,
                    Some(ws_config),
                    false,
                    connector,
                )
                .await
            }
        };
        let (ws_stream, _) = handshake.map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));
        tokio::spawn(crate::pumps::read::read_pump(
            read,
            events_tx,
            write_tx.clone(),
            open.clone(),
            self.config.max_message_size,
            self.config.pong_wait,
            cancel.clone(),
        ));
        tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            self.config.ping_period,
            cancel.clone(),
        ));

        self.replace_link(Some(WsLink {
            write_tx,
            open,
            cancel,
        }));
        info!(url = %self.url, "WebSocket open");
        Ok(events_rx)
    }
}

impl Transport for WsTransport {
    fn open(&self) -> TransportFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>> {
        Box::pin(self.connect())
    }

    fn send(&self, text: String) -> TransportFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let (write_tx, open) = self.current_link().ok_or(TransportError::NotOpen)?;
            if !open.load(Ordering::SeqCst) {
                return Err(TransportError::NotOpen);
            }
            write_tx
                .send(tungstenite::Message::Text(text.into()))
                .await
                .map_err(|_| TransportError::Closed)
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.replace_link(None);
        })
    }

    fn is_open(&self) -> bool {
        self.current_link()
            .is_some_and(|(_, open)| open.load(Ordering::SeqCst))
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.link.lock()
            && let Some(link) = guard.take()
        {
            link.shutdown();
        }
    }
}
