//! Client configuration.
//!
//! [`ClientConfig`] is a plain struct with builder-style setters. It
//! implements `Deserialize` so applications can load it from whatever config
//! source they use; durations are expressed in milliseconds there.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use kolibri_protocol::messages::LoginParams;
use kolibri_protocol::methods::PROTOCOL;

use crate::error::ClientError;
use crate::transport::ws::{WS_PING_PERIOD, WsConfig};
use crate::types::ReconnectPolicy;

/// Broker address.
///
/// The URL is `{host}/{project}{path}`; `port`, when set, replaces whatever
/// port the host carries. `tls` applies to `wss://` hosts; `proxy` tunnels
/// the connection through an HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Scheme and authority, e.g. `wss://broker.example.com`.
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub project: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_subprotocol")]
    pub subprotocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyOptions>,
}

/// TLS settings for `wss://` brokers. Without them the bundled web PKI roots
/// are trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsOptions {
    /// PEM file with CA certificates trusted in addition to the web PKI roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// PEM certificate chain presented to the broker. Requires `client_key_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_file: Option<PathBuf>,
    /// Skips server certificate verification (self-signed test brokers).
    pub accept_invalid_certs: bool,
}

/// An HTTP proxy reached with `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyOptions {
    /// `http://host:port`.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_subprotocol() -> String {
    PROTOCOL.to_string()
}

impl Endpoint {
    pub fn new(host: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            project: project.into(),
            path: default_path(),
            subprotocol: default_subprotocol(),
            tls: None,
            proxy: None,
        }
    }

    /// Builds the broker URL.
    pub fn url(&self) -> Result<Url, ClientError> {
        let raw = format!("{}/{}{}", self.host, self.project, self.path);
        let mut url =
            Url::parse(&raw).map_err(|e| ClientError::InvalidEndpoint(format!("{raw}: {e}")))?;
        if let Some(port) = self.port {
            url.set_port(Some(port))
                .map_err(|()| ClientError::InvalidEndpoint(format!("{raw}: cannot set port")))?;
        }
        Ok(url)
    }
}

/// Everything needed to build a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Credentials used by `login` and by session restoration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<LoginParams>,
    /// Automatic reconnection. `None` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectPolicy>,
    /// Per-request timeout. `None` waits until a response or disconnect.
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    /// WebSocket keepalive ping interval.
    #[serde(default = "default_ping_interval", with = "millis")]
    pub ping_interval: Duration,
}

fn default_ping_interval() -> Duration {
    WS_PING_PERIOD
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::new(host, project),
            auth: None,
            reconnect: None,
            request_timeout: None,
            ping_interval: default_ping_interval(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint.port = Some(port);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.endpoint.path = path.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.endpoint.tls = Some(tls);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyOptions) -> Self {
        self.endpoint.proxy = Some(proxy);
        self
    }

    pub fn with_auth(mut self, auth: LoginParams) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub(crate) fn ws_config(&self) -> WsConfig {
        WsConfig {
            ping_period: self.ping_interval,
            // Two missed pings mean the socket is gone.
            pong_wait: self.ping_interval.saturating_mul(2),
            ..WsConfig::default()
        }
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::path::PathBuf;
use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds.
pub(crate) mod opt_millis {
    use std::path::PathBuf;
use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => super::millis::serialize(d, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
