//! Numeric error codes returned by the broker.

use std::fmt;

/// Named error kind for a numeric protocol error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    General,
    InvalidOpCode,
    InvalidOption,
    InvalidProtocolVersion,
    AccessDenied,
    InvalidPath,
    InvalidNodeType,
    InvalidNodeIndex,
    InvalidNodeProperty,
    InvalidNodeState,
    InvalidSequenceNumber,
    InvalidDataType,
    InvalidRecipient,
    InvalidProtocol,
    MissingParameter,
    InvalidParameter,
    InvalidValue,
    ItemNotFound,
    ItemExists,
    RateLimitExceeded,
    QueueSizeLimitExceeded,
    /// JSON-RPC "method not found".
    MethodNotFound,
    /// A custom RPC handler failed while processing a call.
    RpcProcessing,
    /// Any code not listed above.
    Unknown(i32),
}

/// JSON-RPC 2.0 "method not found".
pub const METHOD_NOT_FOUND: i32 = -32601;

/// Generic processing failure of a custom RPC handler.
///
/// Lives in the JSON-RPC implementation-defined server error range.
pub const RPC_PROCESSING_ERROR: i32 = -32000;

const KNOWN: &[(i32, ErrorKind, &str)] = &[
    (-31901, ErrorKind::General, "General request error"),
    (-31902, ErrorKind::InvalidOpCode, "Invalid op code error"),
    (-31903, ErrorKind::InvalidOption, "Invalid option error"),
    (-31904, ErrorKind::InvalidProtocolVersion, "Invalid protocol version error"),
    (-31905, ErrorKind::AccessDenied, "Access denied error"),
    (-31906, ErrorKind::InvalidPath, "Invalid path error"),
    (-31907, ErrorKind::InvalidNodeType, "Invalid node type error"),
    (-31908, ErrorKind::InvalidNodeIndex, "Invalid node index error"),
    (-31909, ErrorKind::InvalidNodeProperty, "Invalid node property error"),
    (-31910, ErrorKind::InvalidNodeState, "Invalid node state error"),
    (-31911, ErrorKind::InvalidSequenceNumber, "Invalid sequence number error"),
    (-31912, ErrorKind::InvalidDataType, "Invalid data type error"),
    (-31913, ErrorKind::InvalidRecipient, "Invalid recipient error"),
    (-31914, ErrorKind::InvalidProtocol, "Invalid protocol error"),
    (-31915, ErrorKind::MissingParameter, "Missing parameter error"),
    (-31916, ErrorKind::InvalidParameter, "Invalid parameter error"),
    (-31917, ErrorKind::InvalidValue, "Invalid value error"),
    (-31918, ErrorKind::ItemNotFound, "Item not found error"),
    (-31919, ErrorKind::ItemExists, "Item exists error"),
    (-31920, ErrorKind::RateLimitExceeded, "Rate limit exceeded error"),
    (-31921, ErrorKind::QueueSizeLimitExceeded, "Queue size limit exceeded error"),
    (METHOD_NOT_FOUND, ErrorKind::MethodNotFound, "Method not found"),
    (RPC_PROCESSING_ERROR, ErrorKind::RpcProcessing, "Kolibri RPC error"),
];

impl ErrorKind {
    /// Maps a numeric error code to its kind. Unlisted codes become
    /// [`ErrorKind::Unknown`].
    pub fn from_code(code: i32) -> Self {
        KNOWN
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown(code))
    }

    /// Returns the numeric code for this kind.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Unknown(code) => code,
            kind => KNOWN
                .iter()
                .find(|(_, k, _)| *k == kind)
                .map(|(c, _, _)| *c)
                .unwrap_or_default(),
        }
    }

    /// Human-readable message for this kind.
    pub fn message(self) -> &'static str {
        KNOWN
            .iter()
            .find(|(_, k, _)| *k == self)
            .map(|(_, _, m)| *m)
            .unwrap_or("Unknown request error")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
