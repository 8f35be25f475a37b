//! Upstream routing configuration
//!
//! Each `[upstreams.<id>]` section becomes one `RoutingConfig`. The first path
//! segment of an inbound request selects the section by id.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::parser::WireFormat;

// ─────────────────────────────────────────────────────────────────────────────
// Header Directives
// ─────────────────────────────────────────────────────────────────────────────

/// When a configured header is applied to the outbound request
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPriority {
    /// Added only if the client did not send the header
    #[default]
    Low,
    /// Always overrides whatever the client sent
    High,
}

impl HeaderPriority {
    /// Convert to string for TOML serialization
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

/// A header to set on requests forwarded to an upstream
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderDirective {
    /// Lowercased header name
    pub name: String,
    /// Literal value
    pub value: Option<String>,
    /// Environment variable holding the value (wins over `value`)
    pub value_env: Option<String>,
    pub priority: HeaderPriority,
}

impl HeaderDirective {
    /// Resolve the header value: env var > literal value
    /// Returns None when neither yields a non-empty value
    pub fn resolve_value(&self) -> Option<String> {
        if let Some(env_name) = &self.value_env {
            if let Ok(value) = std::env::var(env_name) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        self.value.clone().filter(|v| !v.is_empty())
    }
}

/// Header directive as loaded from config file
#[derive(Debug, Clone, Deserialize)]
pub struct FileHeaderDirective {
    pub name: String,
    pub value: Option<String>,
    pub value_env: Option<String>,
    #[serde(default)]
    pub priority: HeaderPriority,
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Where and how to forward requests arriving under one routing identifier
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingConfig {
    /// Routing identifier (the `[upstreams.<id>]` key)
    pub id: String,
    /// Destination base URL; None answers with a canned response
    pub base_url: Option<String>,
    /// Wire format the client speaks
    pub input_format: WireFormat,
    /// Wire format the upstream speaks, when it differs from the input
    pub output_format: Option<WireFormat>,
    /// Persist auth-like headers unmasked
    pub keep_auth_headers: bool,
    /// Accepted proxy credentials; empty means open access
    pub keys: Vec<String>,
    pub headers: Vec<HeaderDirective>,
}

/// Upstream settings as loaded from config file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileUpstream {
    pub base_url: Option<String>,
    pub input_format: Option<WireFormat>,
    pub output_format: Option<WireFormat>,
    pub keep_auth_headers: Option<bool>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub headers: Vec<FileHeaderDirective>,
}

impl RoutingConfig {
    /// Create from file config with defaults
    pub fn from_file(id: &str, file: FileUpstream) -> Self {
        Self {
            id: id.to_string(),
            base_url: file
                .base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            input_format: file.input_format.unwrap_or(WireFormat::Anthropic),
            output_format: file.output_format,
            keep_auth_headers: file.keep_auth_headers.unwrap_or(false),
            keys: file.keys,
            headers: file
                .headers
                .into_iter()
                .map(|h| HeaderDirective {
                    name: h.name.to_ascii_lowercase(),
                    value: h.value,
                    value_env: h.value_env,
                    priority: h.priority,
                })
                .collect(),
        }
    }

    /// True when the upstream expects a different wire format than the client sends
    pub fn needs_conversion(&self) -> bool {
        self.output_format
            .is_some_and(|output| output != self.input_format)
    }

    /// Directives in application order: low priority first, high priority last
    pub fn ordered_headers(&self) -> impl Iterator<Item = &HeaderDirective> {
        let low = self
            .headers
            .iter()
            .filter(|h| h.priority == HeaderPriority::Low);
        let high = self
            .headers
            .iter()
            .filter(|h| h.priority == HeaderPriority::High);
        low.chain(high)
    }
}

/// Built-in upstreams used when the config file has no `[upstreams]` section
pub(crate) fn default_upstreams() -> BTreeMap<String, RoutingConfig> {
    let anthropic = RoutingConfig::from_file(
        "anthropic",
        FileUpstream {
            base_url: Some("https://api.anthropic.com".to_string()),
            input_format: Some(WireFormat::Anthropic),
            ..Default::default()
        },
    );
    let openai = RoutingConfig::from_file(
        "openai",
        FileUpstream {
            base_url: Some("https://api.openai.com".to_string()),
            input_format: Some(WireFormat::OpenaiResponses),
            ..Default::default()
        },
    );

    [anthropic, openai]
        .into_iter()
        .map(|routing| (routing.id.clone(), routing))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Lookup
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves a routing identifier to its upstream configuration
#[async_trait]
pub trait RoutingLookup: Send + Sync {
    async fn lookup(&self, id: &str) -> Option<Arc<RoutingConfig>>;
}

/// Routing lookup backed by the `[upstreams.*]` config sections
#[derive(Debug, Clone, Default)]
pub struct ConfigRouting {
    upstreams: HashMap<String, Arc<RoutingConfig>>,
}

impl ConfigRouting {
    pub fn new(upstreams: &BTreeMap<String, RoutingConfig>) -> Self {
        Self {
            upstreams: upstreams
                .iter()
                .map(|(id, routing)| (id.clone(), Arc::new(routing.clone())))
                .collect(),
        }
    }
}

#[async_trait]
impl RoutingLookup for ConfigRouting {
    async fn lookup(&self, id: &str) -> Option<Arc<RoutingConfig>> {
        self.upstreams.get(id).cloned()
    }
}
