//! Connects to a Kolibri broker, logs in, subscribes to one node and prints
//! every change until Ctrl+C.
//!
//! Configured through the environment:
//! `KOLIBRI_URL` (default `ws://localhost:8080`), `KOLIBRI_PROJECT`,
//! `KOLIBRI_USER`, `KOLIBRI_PASSWORD` and `KOLIBRI_NODE`.

use std::env;

use anyhow::Context;
use kolibri_protocol::messages::{LoginParams, SubscribeParams};
use kolibri_client::{Client, ClientConfig, ReconnectPolicy};
use tracing_subscriber::EnvFilter;

fn var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let auth = LoginParams {
        user: var("KOLIBRI_USER", "kolibro_01"),
        password: env::var("KOLIBRI_PASSWORD").ok(),
        ..LoginParams::default()
    };
    let config = ClientConfig::new(
        var("KOLIBRI_URL", "ws://localhost:8080"),
        var("KOLIBRI_PROJECT", "demo"),
    )
    .with_auth(auth)
    .with_reconnect(ReconnectPolicy::default().resume_subscriptions(true));

    let client = Client::new(config).context("invalid broker endpoint")?;

    client.on_write(|nodes| {
        for node in nodes {
            tracing::info!(%node, "node changed");
        }
    });
    client.on_disconnect(|code, reason| tracing::warn!(code, reason, "disconnected"));
    client.on_reconnect(|| tracing::info!("session restored"));
    client.on_error(|e| tracing::error!(error = %e, "client error"));

    client.connect().await.context("connecting to broker")?;
    let login = client.login(None).await.context("login")?;
    tracing::info!(client = ?login.client, "logged in");

    let node = var("KOLIBRI_NODE", "/demo/counter");
    let rows = client
        .subscribe(vec![SubscribeParams::new(node.as_str())])
        .await
        .context("subscribe")?;
    for row in rows {
        tracing::info!(%row, "subscribed");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    if let Err(e) = client.logout().await {
        tracing::warn!(error = %e, "logout failed");
    }
    client.disconnect().await;
    Ok(())
}
