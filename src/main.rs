// llmtap - Observability reverse proxy for LLM APIs
//
// Clients address the proxy as `/<upstream>/<path>`. Each request is forwarded
// to the configured upstream and the response streams back unchanged, while a
// copy of every exchange is normalized and persisted in the background.
//
// Architecture:
// - Proxy server (axum): Routes, authorizes and forwards traffic
// - Tee: Splits the upstream body between the client and the capture pipeline
// - Capture: Decompress, parse via wire adapters, price, preview, sanitize
// - Storage: SQLite or JSON Lines records of every exchange

mod cli;
mod config;
mod conversation;
mod decompress;
mod parser;
mod pricing;
mod proxy;
mod sanitize;
mod storage;
mod util;

use anyhow::{Context, Result};
use config::{Config, LogRotation, LoggingConfig};
use pricing::{HttpPriceSource, PricingResolver};
use proxy::ProxyState;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives used when RUST_LOG is unset
fn default_filter(logging: &LoggingConfig) -> String {
    format!("llmtap={}", logging.level)
}

/// Initialize tracing, returning the file writer guard when file logging is on
///
/// Precedence: RUST_LOG env var > config file > default "info"
fn init_tracing(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(logging).into());

    let stdout_json = logging
        .json
        .then(|| tracing_subscriber::fmt::layer().json());
    let stdout_plain = (!logging.json).then(tracing_subscriber::fmt::layer);

    // The guard must be kept alive for the duration of the program to ensure logs flush
    let (file_layer, guard) = if logging.file_enabled {
        match std::fs::create_dir_all(&logging.file_dir) {
            Ok(()) => {
                let file_appender = match logging.file_rotation {
                    LogRotation::Hourly => {
                        tracing_appender::rolling::hourly(&logging.file_dir, &logging.file_prefix)
                    }
                    LogRotation::Daily => {
                        tracing_appender::rolling::daily(&logging.file_dir, &logging.file_prefix)
                    }
                    LogRotation::Never => {
                        tracing_appender::rolling::never(&logging.file_dir, &logging.file_prefix)
                    }
                };
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // File layer uses JSON format for structured log parsing
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not create log directory {:?}: {}",
                    logging.file_dir, e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_json)
        .with(stdout_plain)
        .with(file_layer)
        .init();

    guard
}

/// Price resolver from the `[pricing]` section; disabled without a url
fn build_pricing(config: &Config) -> Result<Arc<PricingResolver>> {
    let pricing = &config.pricing;
    if !pricing.is_active() {
        tracing::info!("Pricing disabled, records will carry no cost");
        return Ok(Arc::new(PricingResolver::disabled()));
    }

    let fetch_timeout = Duration::from_secs(pricing.fetch_timeout_secs);
    let client = reqwest::Client::builder()
        .timeout(fetch_timeout)
        .build()
        .context("Failed to create pricing HTTP client")?;
    let source = HttpPriceSource::new(client, pricing.url.clone());

    tracing::info!(url = %pricing.url, ttl_secs = pricing.ttl_secs, "Pricing enabled");
    Ok(Arc::new(
        PricingResolver::new(Arc::new(source))
            .with_ttl(Duration::from_secs(pricing.ttl_secs))
            .with_fetch_timeout(fetch_timeout)
            .with_retry_after(Duration::from_secs(pricing.retry_after_secs)),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --reset, --path, upstreams)
    if cli::handle_cli() {
        return Ok(());
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env()?;
    let _file_guard = init_tracing(&config.logging);

    tracing::info!("Starting llmtap {}", config::VERSION);

    let store = storage::open_store(&config.storage)?;
    let pricing = build_pricing(&config)?;

    // Warm the price table so the first exchanges are priced
    if config.pricing.is_active() {
        let warm = Arc::clone(&pricing);
        tokio::spawn(async move { warm.refresh_if_stale().await });
    }

    if config.upstreams.is_empty() {
        tracing::warn!("No upstreams configured, every request will be answered with 404");
    }
    for line in config.describe_upstreams() {
        tracing::info!("Upstream {}", line);
    }

    let state = ProxyState::from_config(&config, store, pricing)?;

    // Create shutdown channel for graceful proxy shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut proxy_handle = tokio::spawn(proxy::start_proxy(config.bind_addr, state, shutdown_rx));

    tokio::select! {
        // The server only returns on its own when it failed to start or crashed
        result = &mut proxy_handle => {
            return result.context("Proxy task panicked")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
        }
    }

    tracing::info!("Shutting down...");

    // If the send fails, the proxy has already shut down (which is fine)
    let _ = shutdown_tx.send(());
    proxy_handle.await.context("Proxy task panicked")??;

    tracing::info!("Shutdown complete");
    Ok(())
}
