//! Background capture pipeline
//!
//! Runs after the client response has been committed. Every step here is
//! best-effort: failures are logged and degrade the record, they never reach
//! the client and are never retried.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::sse;
use super::tee::CapturedBody;
use crate::config::{CaptureConfig, RoutingConfig};
use crate::conversation::preview::extract_preview;
use crate::decompress::decompress;
use crate::parser::WireAdapter;
use crate::pricing::PricingResolver;
use crate::sanitize::{sanitize, CapturedHeaders, SanitizeOptions};
use crate::storage::{ExchangeRecord, ExchangeStore};

/// One proxied request/response pair, as transmitted
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub id: String,
    pub routing: Arc<RoutingConfig>,
    pub method: String,
    pub target_url: String,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    /// Time until upstream response headers arrived
    pub ttfb: Option<Duration>,
    pub status: u16,
    /// Outbound request headers, lowercased, unsanitized
    pub request_headers: CapturedHeaders,
    pub response_headers: CapturedHeaders,
    /// Exact bytes as transmitted (possibly compressed)
    pub request_body_raw: Bytes,
    pub response_body_raw: Bytes,
    pub client_disconnected: bool,
    pub body_truncated: bool,
    pub finished: Option<Instant>,
}

impl CapturedExchange {
    /// Fill in the response side from a completed tee
    pub fn attach_body(&mut self, body: CapturedBody) {
        self.response_body_raw = body.bytes;
        self.client_disconnected = body.client_disconnected;
        self.body_truncated = body.truncated;
        self.finished = Some(body.finished_at);
    }
}

/// Capture settings used while building records
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub mask_pii: bool,
    pub preview_max_bytes: usize,
}

impl From<&CaptureConfig> for CaptureOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            mask_pii: config.mask_pii,
            preview_max_bytes: config.preview_max_bytes,
        }
    }
}

/// Collaborators the background pipeline needs
pub struct CaptureContext {
    store: Arc<dyn ExchangeStore>,
    pricing: Arc<PricingResolver>,
    options: CaptureOptions,
}

impl CaptureContext {
    pub fn new(
        store: Arc<dyn ExchangeStore>,
        pricing: Arc<PricingResolver>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            store,
            pricing,
            options,
        }
    }

    /// Finish the exchange in the background once its body has been drained
    pub fn spawn(self: &Arc<Self>, mut exchange: CapturedExchange, body: oneshot::Receiver<CapturedBody>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            match body.await {
                Ok(body) => exchange.attach_body(body),
                Err(_) => {
                    tracing::warn!(id = %exchange.id, "response capture ended before the body completed");
                    exchange.body_truncated = true;
                }
            }
            ctx.persist(exchange).await;
        });
    }

    /// Build the record and hand it to the store; failures are logged
    pub async fn persist(&self, exchange: CapturedExchange) -> Option<String> {
        let id = exchange.id.clone();
        let upstream = exchange.routing.id.clone();
        let record = self.build_record(exchange).await;

        match self.store.persist(&record).await {
            Ok(record_id) => {
                tracing::debug!(
                    id = %record_id,
                    upstream = %upstream,
                    status = record.status,
                    model = record.model().unwrap_or("-"),
                    cost_usd = record.price.as_ref().map(|p| p.cost_usd),
                    "exchange persisted"
                );
                Some(record_id)
            }
            Err(e) => {
                tracing::warn!(
                    id = %id,
                    upstream = %upstream,
                    backend = self.store.backend(),
                    error = %e,
                    "failed to persist exchange"
                );
                None
            }
        }
    }

    /// Decompress, parse, price, preview and sanitize one exchange
    pub async fn build_record(&self, exchange: CapturedExchange) -> ExchangeRecord {
        let routing = Arc::clone(&exchange.routing);
        let adapter = routing.input_format.adapter();

        let request_body = decompress_offloaded(
            exchange.request_body_raw.clone(),
            exchange.request_headers.get("content-encoding"),
        )
        .await;
        let response_body = decompress_offloaded(
            exchange.response_body_raw.clone(),
            exchange.response_headers.get("content-encoding"),
        )
        .await;

        let streamed = sse::is_sse_response(exchange.response_headers.get("content-type"));
        let request_json = request_body
            .as_deref()
            .and_then(|body| serde_json::from_slice::<Value>(body).ok());
        let response_json = response_body
            .as_deref()
            .and_then(|body| response_json(adapter, streamed, body, &exchange.id));

        let (conversation, conversation_error) = if request_json.is_some() || response_json.is_some() {
            match adapter.parse_conversation(request_json.as_ref(), response_json.as_ref()) {
                Ok(conversation) => (Some(conversation), None),
                Err(e) => {
                    tracing::warn!(
                        id = %exchange.id,
                        adapter = adapter.name(),
                        reason = %e.reason,
                        "conversation not available"
                    );
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        let usage = conversation
            .as_ref()
            .and_then(|c| c.usage)
            .or_else(|| {
                response_json
                    .as_ref()
                    .and_then(|r| r.get("usage"))
                    .and_then(|u| adapter.extract_usage(u))
            });

        let price = match (conversation.as_ref().map(|c| c.models.effective()), usage) {
            (Some(model), Some(usage)) if !model.is_empty() => {
                self.pricing.price(model, &usage).await
            }
            _ => None,
        };

        let preview = conversation
            .as_ref()
            .map(|c| extract_preview(c, self.options.preview_max_bytes))
            .unwrap_or_default();

        let (request_headers, response_headers) = if routing.keep_auth_headers {
            (exchange.request_headers, exchange.response_headers)
        } else {
            let options = SanitizeOptions {
                mask_pii: self.options.mask_pii,
            };
            (
                sanitize(&exchange.request_headers, options),
                sanitize(&exchange.response_headers, options),
            )
        };

        let finished = exchange.finished.unwrap_or_else(Instant::now);
        ExchangeRecord {
            id: exchange.id,
            upstream: routing.id.clone(),
            method: exchange.method,
            url: exchange.target_url,
            started_at: exchange.started_at,
            status: exchange.status,
            ttfb_ms: exchange.ttfb.map(|d| d.as_millis() as u64),
            duration_ms: finished.saturating_duration_since(exchange.started).as_millis() as u64,
            request_headers,
            response_headers,
            request_body_size: exchange.request_body_raw.len(),
            response_body_size: exchange.response_body_raw.len(),
            request_body: request_body.and_then(|b| String::from_utf8(b).ok()),
            response_body: response_body.and_then(|b| String::from_utf8(b).ok()),
            streamed,
            client_disconnected: exchange.client_disconnected,
            body_truncated: exchange.body_truncated,
            conversation,
            conversation_error,
            usage,
            price,
            preview,
        }
    }
}

/// Decompress on the blocking pool; None for an empty body
async fn decompress_offloaded(raw: Bytes, content_encoding: Option<&str>) -> Option<Vec<u8>> {
    if raw.is_empty() {
        return None;
    }
    let encoding = content_encoding.map(str::to_string);
    let fallback = raw.clone();
    match tokio::task::spawn_blocking(move || decompress(&raw, encoding.as_deref())).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "decompression task failed, using raw bytes");
            Some(fallback.to_vec())
        }
    }
}

/// Response JSON, rebuilt from the event stream when the response was SSE
fn response_json(
    adapter: &dyn WireAdapter,
    streamed: bool,
    body: &[u8],
    exchange_id: &str,
) -> Option<Value> {
    if !streamed {
        return serde_json::from_slice(body).ok();
    }
    match sse::parse(body) {
        Ok(events) => adapter.reassemble_from_sse(&events),
        Err(e) => {
            tracing::warn!(id = %exchange_id, error = %e, "could not parse event stream");
            None
        }
    }
}
