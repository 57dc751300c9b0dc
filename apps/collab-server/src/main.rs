//! Collaborative editing WebSocket server
//! Real-time multi-user session synchronization

mod auth;
mod config;
mod hub;
mod ws;

use std::sync::Arc;

use collab::TracingAudit;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::auth::StaticTokenAuthenticator;
use crate::config::ServerConfig;
use crate::hub::CollaborationHub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_server=debug,collab=debug")),
        )
        .init();

    let config = ServerConfig::from_env();
    let authenticator = Arc::new(StaticTokenAuthenticator::new(config.auth_token.clone()));
    let (hub, events_rx) = CollaborationHub::new(config, authenticator, Arc::new(TracingAudit), None);

    tokio::spawn(hub.clone().run_event_drain(events_rx));

    let ping_hub = hub.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_hub.config.ping_interval());
        loop {
            interval.tick().await;
            ping_hub.ping_sweep().await;
        }
    });

    let cleanup_hub = hub.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_hub.config.cleanup_interval());
        loop {
            interval.tick().await;
            cleanup_hub.cleanup_sweep().await;
        }
    });

    let listener = TcpListener::bind(&hub.config.bind_addr).await?;
    info!("collaboration server listening on {}", hub.config.bind_addr);

    while let Ok((stream, addr)) = listener.accept().await {
        info!("new connection from {addr}");
        tokio::spawn(ws::handle_connection(stream, addr, hub.clone()));
    }

    Ok(())
}
