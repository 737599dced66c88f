//! Read, write and keepalive tasks for one WebSocket connection.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
