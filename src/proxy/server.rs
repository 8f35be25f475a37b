//! Proxy server setup and initialization

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::any, Router};
use tokio::net::TcpListener;

use super::handlers::proxy_handler;
use super::state::ProxyState;

/// Build the router - every path is proxied
///
/// `/` has no routing identifier and falls through to the handler, which
/// answers 404.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/*path", any(proxy_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

/// Start the proxy server
pub async fn start_proxy(
    bind_addr: SocketAddr,
    state: ProxyState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    tracing::info!("Starting proxy on {}", bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Proxy listening on {}", bind_addr);

    // Start serving requests with graceful shutdown
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}
