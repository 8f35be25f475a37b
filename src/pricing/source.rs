// Price table sources
//
// The price index is a JSON object keyed by model id. Each value is either a
// flat quote, or a keyed table of quotes (e.g. one entry per provider that
// serves a model family). Keyed tables are flattened into plain model -> quote
// entries once, here, so lookups never need to sniff the shape again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{PriceQuote, PriceTable};

/// Where the price table comes from
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self) -> Result<PriceTable>;
}

/// A fixed table; the default is empty (pricing disabled)
#[derive(Debug, Clone, Default)]
pub struct StaticPriceSource {
    table: PriceTable,
}

impl StaticPriceSource {
    pub fn new(table: PriceTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn fetch(&self) -> Result<PriceTable> {
        Ok(self.table.clone())
    }
}

/// Fetches the price index over HTTP
pub struct HttpPriceSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPriceSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch(&self) -> Result<PriceTable> {
        tracing::debug!(url = %self.url, "fetching price table");
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to reach price index")?
            .error_for_status()
            .context("Price index returned an error status")?
            .json()
            .await
            .context("Price index is not valid JSON")?;
        ingest(body)
    }
}

/// A quote as it appears in the index (USD per million tokens)
#[derive(Debug, Clone, Deserialize)]
struct WireQuote {
    input: f64,
    output: f64,
    #[serde(default)]
    cache_read: Option<f64>,
    #[serde(default)]
    cache_write: Option<f64>,
    #[serde(default)]
    provider: Option<String>,
}

impl WireQuote {
    fn into_quote(self, default_provider: &str) -> PriceQuote {
        PriceQuote {
            input_per_million: self.input,
            output_per_million: self.output,
            cache_read_per_million: self.cache_read,
            cache_write_per_million: self.cache_write,
            provider: self
                .provider
                .unwrap_or_else(|| default_provider.to_string()),
        }
    }
}

/// One top-level index entry
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PriceEntry {
    Quote(WireQuote),
    Keyed(HashMap<String, WireQuote>),
}

/// Flatten a raw price index into a table
///
/// Entries matching neither shape are skipped.
pub fn ingest(index: Value) -> Result<PriceTable> {
    let Value::Object(entries) = index else {
        anyhow::bail!("price index must be a JSON object keyed by model id");
    };

    let mut table = PriceTable::new();
    for (key, raw) in entries {
        match serde_json::from_value::<PriceEntry>(raw) {
            Ok(PriceEntry::Quote(quote)) => {
                table.insert(key, quote.into_quote("unknown"));
            }
            Ok(PriceEntry::Keyed(quotes)) => {
                for (model, quote) in quotes {
                    table.insert(model, quote.into_quote(&key));
                }
            }
            Err(e) => {
                tracing::debug!(entry = %key, error = %e, "skipping unrecognized price entry");
            }
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ingest_flat_and_keyed_entries() {
        let table = ingest(json!({
            "claude-x": {"input": 3, "output": 15, "cache_read": 0.3, "cache_write": 3.75, "provider": "anthropic"},
            "openai": {
                "gpt-x": {"input": 1.25, "output": 10},
                "gpt-x-mini": {"input": 0.25, "output": 2, "provider": "azure"}
            },
            "broken": {"input": "free"}
        }))
        .unwrap();

        assert_eq!(table.len(), 3);
        let claude = &table["claude-x"];
        assert_eq!(claude.input_per_million, 3.0);
        assert_eq!(claude.cache_write_per_million, Some(3.75));
        assert_eq!(claude.provider, "anthropic");
        assert_eq!(table["gpt-x"].provider, "openai");
        assert_eq!(table["gpt-x-mini"].provider, "azure");
        assert!(!table.contains_key("broken"));
    }

    #[test]
    fn test_ingest_rejects_non_object() {
        assert!(ingest(json!([1, 2, 3])).is_err());
    }

    #[tokio::test]
    async fn test_http_source_fetches_and_ingests() {
        use axum::{routing::get, Json, Router};

        let app = Router::new().route(
            "/prices.json",
            get(|| async { Json(json!({"claude-x": {"input": 3, "output": 15}})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let source = HttpPriceSource::new(
            reqwest::Client::new(),
            format!("http://{}/prices.json", addr),
        );
        let table = source.fetch().await.unwrap();
        assert_eq!(table["claude-x"].output_per_million, 15.0);
        assert_eq!(table["claude-x"].provider, "unknown");
    }
}
