//! Method names and protocol identifiers.

/// WebSocket subprotocol negotiated with the broker.
pub const PROTOCOL: &str = "v3.2.c.kolibri";

pub const LOGIN: &str = "kolibri.login";
pub const LOGOUT: &str = "kolibri.logout";
pub const CLOSE: &str = "kolibri.close";
pub const UPDATE_TOKEN: &str = "kolibri.updateToken";
pub const READ: &str = "kolibri.read";
/// Client-to-broker write, and broker-to-client write notification.
pub const WRITE: &str = "kolibri.write";
/// Client-to-broker commit, and broker-to-client commit notification.
pub const COMMIT: &str = "kolibri.commit";
pub const CANCEL: &str = "kolibri.cancel";
pub const SUBSCRIBE: &str = "kolibri.subscribe";
pub const UNSUBSCRIBE: &str = "kolibri.unsubscribe";
pub const UNSUBSCRIBED: &str = "kolibri.unsubscribed";
pub const USER_SUBSCRIBE: &str = "kolibri.user.subscribe";
pub const USER_UNSUBSCRIBE: &str = "kolibri.user.unsubscribe";
pub const USER_NOTIFY: &str = "kolibri.user.notify";
/// Introspection of the custom RPCs a client has registered.
pub const GET_RPC_INFO: &str = "kolibri.getRpcInfo";

