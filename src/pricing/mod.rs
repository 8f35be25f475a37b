// Pricing calculations for captured exchanges
//
// Prices come from an external price index (see `source`), cached in memory
// with a TTL. Lookup is exact-match on the model id: an unknown model has no
// price, and a missing price is never an error.

pub mod source;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::conversation::Usage;
pub use source::{HttpPriceSource, PriceSource, StaticPriceSource};

/// Default cache lifetime for the price table
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default bound on a single price table fetch
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait before retrying after a failed fetch
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Price per million tokens for one model, in USD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_per_million: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_per_million: Option<f64>,
    pub provider: String,
}

/// Priced usage for one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceEstimate {
    pub quote: PriceQuote,
    pub cost_usd: f64,
}

/// Model id -> quote
pub type PriceTable = HashMap<String, PriceQuote>;

/// Calculate cost in USD for the given token usage
///
/// Cache-read and cache-write tokens use their own rates when the quote has
/// them, else the base input rate.
pub fn calculate_cost(quote: &PriceQuote, usage: &Usage) -> f64 {
    let per_token = |tokens: u64, per_million: f64| (tokens as f64 / 1_000_000.0) * per_million;

    let input_cost = per_token(usage.input_tokens, quote.input_per_million);
    let output_cost = per_token(usage.output_tokens, quote.output_per_million);
    let cache_read_cost = per_token(
        usage.cache_read_tokens.unwrap_or(0),
        quote
            .cache_read_per_million
            .unwrap_or(quote.input_per_million),
    );
    let cache_write_cost = per_token(
        usage.cache_write_tokens.unwrap_or(0),
        quote
            .cache_write_per_million
            .unwrap_or(quote.input_per_million),
    );

    input_cost + output_cost + cache_read_cost + cache_write_cost
}

#[derive(Default)]
struct PriceCache {
    table: Arc<PriceTable>,
    fetched_at: Option<Instant>,
    failed_at: Option<Instant>,
}

/// TTL cache over a price source with single-flight refresh
///
/// Readers never wait on a fetch: while one caller refreshes, everyone else
/// is served the table already cached (possibly empty).
pub struct PricingResolver {
    source: Arc<dyn PriceSource>,
    cache: RwLock<PriceCache>,
    refresh_guard: Mutex<()>,
    ttl: Duration,
    fetch_timeout: Duration,
    retry_after: Duration,
}

impl PricingResolver {
    pub fn new(source: Arc<dyn PriceSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(PriceCache::default()),
            refresh_guard: Mutex::new(()),
            ttl: DEFAULT_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    /// Resolver that never has prices
    pub fn disabled() -> Self {
        Self::new(Arc::new(StaticPriceSource::default()))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Current cached table, without refreshing
    pub async fn get(&self) -> Arc<PriceTable> {
        self.cache.read().await.table.clone()
    }

    async fn is_stale(&self) -> bool {
        let cache = self.cache.read().await;
        let expired = cache
            .fetched_at
            .map(|at| at.elapsed() >= self.ttl)
            .unwrap_or(true);
        let backing_off = cache
            .failed_at
            .map(|at| at.elapsed() < self.retry_after)
            .unwrap_or(false);
        expired && !backing_off
    }

    /// Refetch the table if it is stale and nobody else is already doing so
    ///
    /// A failed or timed-out fetch keeps the previous table.
    pub async fn refresh_if_stale(&self) {
        if !self.is_stale().await {
            return;
        }
        let Ok(_guard) = self.refresh_guard.try_lock() else {
            tracing::trace!("price table refresh already in flight");
            return;
        };
        // Another caller may have finished a refresh between the check and the lock
        if !self.is_stale().await {
            return;
        }

        let outcome = tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await;
        let mut cache = self.cache.write().await;
        match outcome {
            Ok(Ok(table)) => {
                tracing::info!(models = table.len(), "price table refreshed");
                cache.table = Arc::new(table);
                cache.fetched_at = Some(Instant::now());
                cache.failed_at = None;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "price table fetch failed, keeping cached prices");
                cache.failed_at = Some(Instant::now());
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.fetch_timeout.as_secs_f64(),
                    "price table fetch timed out, keeping cached prices"
                );
                cache.failed_at = Some(Instant::now());
            }
        }
    }

    /// Price a model's usage; None when the model is not in the table
    pub async fn price(&self, model: &str, usage: &Usage) -> Option<PriceEstimate> {
        self.refresh_if_stale().await;
        let table = self.get().await;
        let quote = table.get(model)?.clone();
        let cost_usd = calculate_cost(&quote, usage);
        Some(PriceEstimate { quote, cost_usd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quote(input: f64, output: f64) -> PriceQuote {
        PriceQuote {
            input_per_million: input,
            output_per_million: output,
            cache_read_per_million: None,
            cache_write_per_million: None,
            provider: "anthropic".to_string(),
        }
    }

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: None,
            cache_write_tokens: None,
        }
    }

    /// Source that counts fetches and can be told to fail or stall
    struct CountingSource {
        fetches: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingSource {
        fn new(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                fail,
                delay,
            })
        }
    }

    #[async_trait]
    impl PriceSource for CountingSource {
        async fn fetch(&self) -> anyhow::Result<PriceTable> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("index unavailable");
            }
            let mut table = PriceTable::new();
            table.insert("claude-x".to_string(), quote(3.0, 15.0));
            Ok(table)
        }
    }

    #[test]
    fn test_calculate_cost_base_rates() {
        let cost = calculate_cost(&quote(3.0, 15.0), &usage(1_000_000, 200_000));
        assert!((cost - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_cost_cache_rates_and_fallback() {
        let mut with_cache = quote(3.0, 15.0);
        with_cache.cache_read_per_million = Some(0.30);
        with_cache.cache_write_per_million = Some(3.75);
        let usage = Usage {
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: Some(1_000_000),
            cache_write_tokens: Some(1_000_000),
        };
        assert!((calculate_cost(&with_cache, &usage) - 4.05).abs() < 1e-9);
        // Without cache rates both categories fall back to the input price
        assert!((calculate_cost(&quote(3.0, 15.0), &usage) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_cost_fully_cached_openai_usage() {
        let usage = crate::parser::extract_usage(&serde_json::json!({
            "input_tokens": 1_000_000,
            "output_tokens": 0,
            "input_tokens_details": {"cached_tokens": 1_000_000}
        }))
        .unwrap();
        // Billed once at the input rate, not twice
        assert!((calculate_cost(&quote(3.0, 15.0), &usage) - 3.0).abs() < 1e-9);

        let mut with_cache = quote(3.0, 15.0);
        with_cache.cache_read_per_million = Some(0.30);
        assert!((calculate_cost(&with_cache, &usage) - 0.30).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_price_known_and_unknown_models() {
        let resolver = PricingResolver::new(CountingSource::new(false, Duration::ZERO));
        let estimate = resolver
            .price("claude-x", &usage(1_000_000, 200_000))
            .await
            .unwrap();
        assert!((estimate.cost_usd - 6.0).abs() < 1e-9);
        assert_eq!(estimate.quote.provider, "anthropic");

        // Exact match only
        assert!(resolver.price("claude-x-latest", &usage(1, 1)).await.is_none());
        assert!(resolver.price("gpt-x", &usage(1, 1)).await.is_none());
    }

    #[tokio::test]
    async fn test_cold_cache_fetches_once_under_concurrency() {
        let source = CountingSource::new(false, Duration::from_millis(50));
        let resolver = Arc::new(PricingResolver::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver.price("claude-x", &usage(10, 10)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(resolver.price("claude-x", &usage(10, 10)).await.is_some());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_serves_cache_and_backs_off() {
        let source = CountingSource::new(true, Duration::ZERO);
        let resolver = PricingResolver::new(source.clone());

        assert!(resolver.price("claude-x", &usage(1, 1)).await.is_none());
        assert!(resolver.price("claude-x", &usage(1, 1)).await.is_none());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let eager = PricingResolver::new(source.clone()).with_retry_after(Duration::ZERO);
        eager.refresh_if_stale().await;
        eager.refresh_if_stale().await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_timeout_keeps_empty_cache() {
        let source = CountingSource::new(false, Duration::from_millis(200));
        let resolver = PricingResolver::new(source).with_fetch_timeout(Duration::from_millis(10));
        assert!(resolver.price("claude-x", &usage(1, 1)).await.is_none());
        assert!(resolver.get().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_resolver_has_no_prices() {
        let resolver = PricingResolver::disabled();
        assert!(resolver.price("claude-x", &usage(1, 1)).await.is_none());
    }
}
