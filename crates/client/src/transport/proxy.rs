//! HTTP `CONNECT` tunnelling for brokers behind a proxy.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use super::TransportError;
use crate::config::ProxyOptions;
use crate::error::ClientError;

/// Largest proxy response head accepted.
const MAX_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct HttpProxy {
    addr: String,
    authorization: Option<String>,
}

impl HttpProxy {
    pub(crate) fn from_options(options: &ProxyOptions) -> Result<Self, ClientError> {
        let invalid =
            |why: &str| ClientError::InvalidEndpoint(format!("proxy {}: {why}", options.url));
        let url = Url::parse(&options.url).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid("only http:// proxies are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let authorization = options.username.as_ref().map(|user| {
            let password = options.password.as_deref().unwrap_or_default();
            format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
        });
        Ok(Self {
            addr: format!("{host}:{port}"),
            authorization,
        })
    }

    /// Opens a tunnel to `target` (`host:port`) and returns the raw stream.
    pub(crate) async fn tunnel(&self, target: &str) -> Result<TcpStream, TransportError> {
        let failed = |why: String| TransportError::Handshake(format!("proxy {}: {why}", self.addr));

        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(authorization) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
        }
        request.push_str("\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| failed(e.to_string()))?;

        let head = read_head(&mut stream).await.map_err(failed)?;
        let status_line = head.lines().next().unwrap_or_default();
        if status_line.split_whitespace().nth(1) != Some("200") {
            return Err(failed(format!("tunnel refused: {status_line}")));
        }
        debug!(proxy = %self.addr, target, "proxy tunnel open");
        Ok(stream)
    }
}

/// Reads the response head byte by byte so nothing past it is consumed.
async fn read_head(stream: &mut TcpStream) -> Result<String, String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err("response head too large".into());
        }
        let n = stream.read(&mut byte).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("connection closed during CONNECT".into());
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}
