//! Capture pipeline and pricing configuration

use serde::Deserialize;
use std::time::Duration;

use crate::conversation::preview::DEFAULT_PREVIEW_MAX_BYTES;
use crate::pricing::{DEFAULT_FETCH_TIMEOUT, DEFAULT_RETRY_AFTER, DEFAULT_TTL};

// ─────────────────────────────────────────────────────────────────────────────
// Capture Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Capture pipeline settings
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Redact IP literals in persisted header values
    pub mask_pii: bool,
    /// Byte limit for each preview field
    pub preview_max_bytes: usize,
    /// Overall timeout for one outbound request, including the body
    pub request_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mask_pii: false,
            preview_max_bytes: DEFAULT_PREVIEW_MAX_BYTES,
            request_timeout_secs: 300,
        }
    }
}

impl CaptureConfig {
    pub fn from_file(file: Option<FileCapture>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            mask_pii: file.mask_pii.unwrap_or(defaults.mask_pii),
            preview_max_bytes: file
                .preview_max_bytes
                .unwrap_or(defaults.preview_max_bytes),
            request_timeout_secs: file
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Capture settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileCapture {
    pub mask_pii: Option<bool>,
    pub preview_max_bytes: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pricing Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Price index settings
///
/// Pricing stays off until an index URL is configured.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub enabled: bool,
    /// Price index endpoint (JSON keyed by model id)
    pub url: String,
    pub ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Wait after a failed fetch before trying again
    pub retry_after_secs: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            ttl_secs: DEFAULT_TTL.as_secs(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs(),
            retry_after_secs: DEFAULT_RETRY_AFTER.as_secs(),
        }
    }
}

impl PricingConfig {
    pub fn from_file(file: Option<FilePricing>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            url: file.url.unwrap_or(defaults.url),
            ttl_secs: file.ttl_secs.unwrap_or(defaults.ttl_secs),
            fetch_timeout_secs: file
                .fetch_timeout_secs
                .unwrap_or(defaults.fetch_timeout_secs),
            retry_after_secs: file.retry_after_secs.unwrap_or(defaults.retry_after_secs),
        }
    }

    /// Whether a price index should actually be queried
    pub fn is_active(&self) -> bool {
        self.enabled && !self.url.trim().is_empty()
    }
}

/// Pricing settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FilePricing {
    pub enabled: Option<bool>,
    pub url: Option<String>,
    pub ttl_secs: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub retry_after_secs: Option<u64>,
}
