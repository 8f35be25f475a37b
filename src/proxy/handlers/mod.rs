//! Request handler for proxied traffic
//!
//! `proxy_handler` resolves the routing identifier, checks the proxy
//! credential, forwards the request and returns the upstream response while
//! the capture pipeline records the exchange in the background.

use axum::{
    body::Body,
    extract::State,
    http::{header, request::Parts, HeaderMap, Request, Response, StatusCode},
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

use super::auth::{AuthDecision, CREDENTIAL_HEADER};
use super::capture::CapturedExchange;
use super::error::ProxyError;
use super::helpers::{
    build_upstream_url, canned_response, client_response_headers, forward_headers, split_route,
};
use super::state::ProxyState;
use super::tee::{tee, CapturedBody};
use crate::config::RoutingConfig;
use crate::sanitize::CapturedHeaders;

/// Main proxy handler - routes, forwards and tees every request
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let started = Instant::now();
    let started_at = Utc::now();
    let (parts, body) = req.into_parts();

    let path = parts.uri.path();
    let (upstream_id, rest) =
        split_route(path).ok_or_else(|| ProxyError::UnknownUpstream(path.to_string()))?;
    let routing = state
        .routing
        .lookup(upstream_id)
        .await
        .ok_or_else(|| ProxyError::UnknownUpstream(upstream_id.to_string()))?;

    let credential = parts
        .headers
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok());
    match state.authorizer.authorize(credential, &routing).await {
        AuthDecision::Allow => {}
        AuthDecision::Missing => return Err(ProxyError::MissingCredential),
        AuthDecision::Deny => return Err(ProxyError::AccessDenied),
    }

    if let Some(output) = routing.output_format.filter(|_| routing.needs_conversion()) {
        return Err(ProxyError::ConversionNotImplemented {
            input: routing.input_format,
            output,
        });
    }

    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;
    let outbound_headers = forward_headers(&parts.headers, &routing);
    let id = uuid::Uuid::new_v4().to_string();

    tracing::debug!(
        id = %id,
        upstream = %routing.id,
        method = %parts.method,
        path = %rest,
        body_size = body_bytes.len(),
        "Proxying request"
    );

    let Some(base_url) = routing.base_url.as_deref() else {
        return respond_canned(
            &state,
            &routing,
            &parts,
            id,
            body_bytes,
            outbound_headers,
            started,
            started_at,
        );
    };
    let target_url = build_upstream_url(base_url, rest, parts.uri.query());

    let mut forward_req = state
        .client
        .request(parts.method.clone(), &target_url)
        .headers(outbound_headers.clone());
    if !body_bytes.is_empty() {
        forward_req = forward_req.body(body_bytes.clone());
    }

    let response = forward_req
        .send()
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;
    let ttfb = started.elapsed();
    let status = response.status();
    let upstream_headers = response.headers().clone();

    tracing::debug!(
        id = %id,
        status = status.as_u16(),
        ttfb_ms = ttfb.as_millis() as u64,
        "Upstream responded"
    );

    let (client_body, captured) = tee(response.bytes_stream());

    let exchange = CapturedExchange {
        id,
        routing: Arc::clone(&routing),
        method: parts.method.to_string(),
        target_url,
        started_at,
        started,
        ttfb: Some(ttfb),
        status: status.as_u16(),
        request_headers: CapturedHeaders::from_header_map(&outbound_headers),
        response_headers: CapturedHeaders::from_header_map(&upstream_headers),
        request_body_raw: body_bytes,
        response_body_raw: Bytes::new(),
        client_disconnected: false,
        body_truncated: false,
        finished: None,
    };
    state.capture.spawn(exchange, captured);

    // Status and headers are exactly the upstream's
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(client_response_headers(&upstream_headers));
    }
    builder
        .body(client_body)
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}

/// Answer locally for an upstream without a destination, still recording it
#[allow(clippy::too_many_arguments)]
fn respond_canned(
    state: &ProxyState,
    routing: &Arc<RoutingConfig>,
    parts: &Parts,
    id: String,
    body_bytes: Bytes,
    outbound_headers: HeaderMap,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
) -> Result<Response<Body>, ProxyError> {
    let (content_type, canned) = canned_response(&routing.id, &parts.headers);
    let canned = Bytes::from(canned);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(canned.clone()))
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))?;

    let exchange = CapturedExchange {
        id,
        routing: Arc::clone(routing),
        method: parts.method.to_string(),
        target_url: parts.uri.to_string(),
        started_at,
        started,
        ttfb: None,
        status: StatusCode::OK.as_u16(),
        request_headers: CapturedHeaders::from_header_map(&outbound_headers),
        response_headers: CapturedHeaders::from_header_map(response.headers()),
        request_body_raw: body_bytes,
        response_body_raw: Bytes::new(),
        client_disconnected: false,
        body_truncated: false,
        finished: None,
    };

    let (tx, rx) = oneshot::channel();
    let _ = tx.send(CapturedBody {
        bytes: canned,
        client_disconnected: false,
        truncated: false,
        finished_at: Instant::now(),
    });
    state.capture.spawn(exchange, rx);

    tracing::debug!(upstream = %routing.id, "No destination configured, answered locally");
    Ok(response)
}
