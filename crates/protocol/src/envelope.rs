use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codes::ErrorKind;

/// JSON-RPC version string carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error object of a failed JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Creates an error object for a known kind with its canonical message.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            code: kind.code(),
            message: kind.message().to_string(),
            data: None,
        }
    }

    /// Attaches diagnostic data.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Returns the named kind for this error's code.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(self.code)
    }
}

/// A JSON-RPC request, in either direction.
///
/// `server` is the routing target of a client-to-client RPC (`_server` on the
/// wire). The broker fills it in on inbound custom calls and expects it
/// echoed back in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "_server", default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Value>,
}

impl Request {
    /// Creates a request with a numeric id and optional params.
    pub fn new<T: Serialize>(
        id: u64,
        method: impl Into<String>,
        params: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let params = params.map(serde_json::to_value).transpose()?;
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params,
            server: None,
        })
    }

    /// Sets the `_server` routing target.
    pub fn with_server(mut self, server: Value) -> Self {
        self.server = Some(server);
        self
    }

    /// Deserializes the params into the given type.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.params {
            Some(raw) => Ok(Some(T::deserialize(raw)?)),
            None => Ok(None),
        }
    }

    /// Builds a success response for this request.
    ///
    /// Returns `None` for notifications (requests without an id).
    pub fn reply(&self, result: Value) -> Option<Response> {
        let id = self.id.clone()?;
        Some(Response {
            server: self.server.clone(),
            ..Response::success(id, result)
        })
    }

    /// Builds an error response for this request.
    ///
    /// Returns `None` for notifications (requests without an id).
    pub fn reply_error(&self, error: RpcError) -> Option<Response> {
        let id = self.id.clone()?;
        Some(Response {
            server: self.server.clone(),
            ..Response::failure(id, error)
        })
    }
}

/// A JSON-RPC response, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(rename = "_server", default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Value>,
}

impl Response {
    fn empty(id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: None,
            server: None,
        }
    }

    /// Creates a success response.
    pub fn success(id: impl Into<Value>, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::empty(id.into())
        }
    }

    /// Creates an error response.
    pub fn failure(id: impl Into<Value>, error: RpcError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(id.into())
        }
    }

    /// Returns the id as an integer, if it is one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_u64()
    }

    /// Splits the response into its result or error.
    ///
    /// A success response whose `result` is `null` yields `Value::Null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// An inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(Request),
    Response(Response),
}

impl Incoming {
    /// Parses a text frame. Objects carrying a `method` are requests,
    /// every other object is treated as a response.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("method").is_some() {
            Ok(Self::Request(serde_json::from_value(value)?))
        } else {
            Ok(Self::Response(serde_json::from_value(value)?))
        }
    }
}
