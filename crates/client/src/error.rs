//! Error types for the Kolibri client.

use serde_json::Value;

use kolibri_protocol::{ErrorKind, RpcError};

use crate::transport::TransportError;

/// Connection-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("socket is not open")]
    NotConnected,

    #[error("could not open connection: {0}")]
    HandshakeFailed(String),

    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotOpen => ConnectionError::NotConnected,
            TransportError::Closed => ConnectionError::Closed,
            TransportError::Handshake(reason) => ConnectionError::HandshakeFailed(reason),
        }
    }
}

/// The peer answered with a recognized numeric error code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub data: Option<Value>,
}

impl From<RpcError> for ProtocolError {
    fn from(e: RpcError) -> Self {
        Self {
            kind: e.kind(),
            data: e.data,
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        let err = RpcError::new(e.kind);
        match e.data {
            Some(data) => err.with_data(data),
            None => err,
        }
    }
}

/// Errors from the Kolibri client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("request failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no handler registered for method {0}")]
    MethodNotFound(String),

    #[error(
        "points with QoS level 0, 1 or 2 must not be mixed in the same write with points which have QoS level 3 or 4"
    )]
    MixedQuality,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("authentication not provided: set ClientConfig::auth or pass login params")]
    MissingAuth,

    #[error("unknown client state: no login to restore")]
    UnknownClientState,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("{context} panicked: {message}")]
    Panicked { context: String, message: String },

    #[error("response to {method} could not be sent: {source}")]
    ResponseNotSent {
        method: String,
        #[source]
        source: Box<ClientError>,
    },
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        ClientError::Connection(e.into())
    }
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        ClientError::Protocol(e.into())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(err.to_string(), "request timed out");

        let err = ClientError::Connection(ConnectionError::NotConnected);
        assert_eq!(err.to_string(), "connection error: socket is not open");

        let err = ClientError::MethodNotFound("foo".into());
        assert!(err.to_string().contains("foo"));
    }

    #[test]
    fn rpc_error_converts_to_protocol_kind() {
        let rpc = RpcError {
            code: -31918,
            message: "broker text".into(),
            data: Some(json!("/missing")),
        };
        let err: ClientError = rpc.into();
        match err {
            ClientError::Protocol(p) => {
                assert_eq!(p.kind, ErrorKind::ItemNotFound);
                assert_eq!(p.data, Some(json!("/missing")));
                assert_eq!(p.to_string(), "Item not found error");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn protocol_error_round_trips_to_rpc_error() {
        let err = ProtocolError {
            kind: ErrorKind::RateLimitExceeded,
            data: None,
        };
        let rpc: RpcError = err.into();
        assert_eq!(rpc.code, -31920);
        assert!(rpc.data.is_none());
    }

    #[test]
    fn transport_errors_are_connection_errors() {
        let err: ClientError = TransportError::NotOpen.into();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::NotConnected)
        ));
    }
}
