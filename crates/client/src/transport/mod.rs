//! Transport capability the connection manager drives.
//!
//! A transport opens one socket at a time. Each successful [`Transport::open`]
//! hands back a fresh event receiver for that socket; the receiver yields
//! inbound text frames and ends with a single [`TransportEvent::Closed`].

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod proxy;
pub(crate) mod tls;
pub mod ws;

pub use ws::WsTransport;

/// A boxed future returned by transport methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Close code reported when the socket ends without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code for a normal, locally requested close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Events delivered for one open socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound text frame.
    Message(String),
    /// The socket closed. Always the last event of a socket.
    Closed { code: u16, reason: String },
}

/// Errors from a transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("socket is not open")]
    NotOpen,

    #[error("socket closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A message-oriented, reopenable socket.
pub trait Transport: Send + Sync + 'static {
    /// Opens the socket and returns the event stream for it.
    fn open(&self) -> TransportFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>>;

    /// Sends one text frame.
    fn send(&self, text: String) -> TransportFuture<'_, Result<(), TransportError>>;

    /// Closes the socket, if open.
    fn close(&self) -> TransportFuture<'_, ()>;

    /// Returns `true` while the socket is open.
    fn is_open(&self) -> bool;
}
