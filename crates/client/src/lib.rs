//! Persistent Kolibri consumer client.
//!
//! Keeps a bidirectional JSON-RPC session with a Kolibri broker alive over
//! WebSocket: requests are correlated with their responses, broker calls
//! (write notifications, commits, unsubscriptions, user notifications and
//! custom RPCs) are answered, and a dropped connection is re-established
//! with exponential backoff and the session restored.

mod client;
pub mod config;
mod correlator;
mod dispatcher;
pub mod error;
mod listeners;
pub(crate) mod manager;
pub(crate) mod pumps;
pub(crate) mod reconnection;
mod session;
mod subscription;
pub mod transport;
pub mod types;
mod write;

pub use client::Client;
pub use config::{ClientConfig, Endpoint, ProxyOptions, TlsOptions};
pub use dispatcher::{BoxError, RpcFuture, RpcHandler};
pub use error::{ClientError, ConnectionError, ProtocolError};
pub use listeners::{
    DisconnectCallback, ErrorCallback, NotifyCallback, ReconnectCallback, WriteCallback,
};
pub use transport::{Transport, TransportError, TransportEvent, WsTransport};
pub use types::{ConnectionState, ReconnectPolicy};

pub use kolibri_protocol as protocol;
