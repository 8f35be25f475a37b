//! Proxy state shared by every request

use anyhow::{Context, Result};
use std::sync::Arc;

use super::auth::{Authorizer, KeyAuthorizer};
use super::capture::{CaptureContext, CaptureOptions};
use crate::config::{Config, ConfigRouting, RoutingLookup};
use crate::pricing::PricingResolver;
use crate::storage::ExchangeStore;

/// Shared state for the proxy server
///
/// Everything here is immutable or internally synchronized; handlers clone
/// the state per request.
#[derive(Clone)]
pub struct ProxyState {
    /// HTTP client for forwarding requests
    pub(super) client: reqwest::Client,
    pub(super) routing: Arc<dyn RoutingLookup>,
    pub(super) authorizer: Arc<dyn Authorizer>,
    /// Background capture pipeline
    pub(super) capture: Arc<CaptureContext>,
}

impl ProxyState {
    pub fn new(
        client: reqwest::Client,
        routing: Arc<dyn RoutingLookup>,
        authorizer: Arc<dyn Authorizer>,
        capture: Arc<CaptureContext>,
    ) -> Self {
        Self {
            client,
            routing,
            authorizer,
            capture,
        }
    }

    /// State wired from configuration: config-backed routing, key authorization
    pub fn from_config(
        config: &Config,
        store: Arc<dyn ExchangeStore>,
        pricing: Arc<PricingResolver>,
    ) -> Result<Self> {
        let capture = CaptureContext::new(store, pricing, CaptureOptions::from(&config.capture));
        Ok(Self::new(
            build_client(config)?,
            Arc::new(ConfigRouting::new(&config.upstreams)),
            Arc::new(KeyAuthorizer),
            Arc::new(capture),
        ))
    }
}

/// Build the outbound HTTP client
///
/// Transparent decompression is off: the client must receive the upstream's
/// bytes unchanged, and decoding happens in the capture pipeline.
pub fn build_client(config: &Config) -> Result<reqwest::Client> {
    // NOTE: No default User-Agent set - the client's own User-Agent is forwarded.
    reqwest::Client::builder()
        .timeout(config.capture.request_timeout())
        .pool_max_idle_per_host(10)
        .gzip(false)
        // Force HTTP/1.1 to avoid HTTP/2 connection reset issues with some providers
        .http1_only()
        .build()
        .context("Failed to create HTTP client")
}
