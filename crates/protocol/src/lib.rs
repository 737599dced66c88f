//! Wire protocol definitions for the Kolibri consumer client.
//!
//! Covers the JSON-RPC 2.0 envelope, method names, numeric error codes and
//! the handful of parameter shapes the client core interprets. The rest of
//! the Kolibri message catalogue travels as opaque JSON.

pub mod codes;
pub mod envelope;
pub mod messages;
pub mod methods;

pub use codes::ErrorKind;
pub use envelope::{Incoming, JSONRPC_VERSION, Request, Response, RpcError};
