//! Utility functions for request/response processing

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use super::auth::CREDENTIAL_HEADER;
use crate::config::{HeaderPriority, RoutingConfig};
use crate::util::media_type_is;

/// Connection-level headers that never cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Split `/<upstream>/<rest>` into the routing identifier and the remaining path
///
/// The remaining path keeps its leading slash; it is empty for `/<upstream>`.
pub(crate) fn split_route(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let (id, rest) = match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    };
    (!id.is_empty()).then_some((id, rest))
}

/// Build the upstream URL from a base URL, the remaining path and query
pub(crate) fn build_upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", base_url.trim_end_matches('/'), path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Build outbound headers from the inbound ones
///
/// Drops hop-by-hop headers, `host`, `content-length` (recomputed by the
/// client) and the proxy credential, then applies the routing directives:
/// low priority only when absent, high priority always.
pub(crate) fn forward_headers(inbound: &HeaderMap, routing: &RoutingConfig) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(inbound.len() + routing.headers.len());
    for (name, value) in inbound {
        let lower = name.as_str();
        if lower == "host"
            || lower == header::CONTENT_LENGTH.as_str()
            || lower == CREDENTIAL_HEADER
            || is_hop_by_hop(lower)
        {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    for directive in routing.ordered_headers() {
        let Some(value) = directive.resolve_value() else {
            tracing::debug!(
                upstream = %routing.id,
                header = %directive.name,
                "header directive has no value, skipping"
            );
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(directive.name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            tracing::warn!(
                upstream = %routing.id,
                header = %directive.name,
                "invalid header directive, skipping"
            );
            continue;
        };

        match directive.priority {
            HeaderPriority::Low => {
                if !outbound.contains_key(&name) {
                    outbound.insert(name, value);
                }
            }
            HeaderPriority::High => {
                outbound.insert(name, value);
            }
        }
    }
    outbound
}

/// Upstream response headers as returned to the client
pub(crate) fn client_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Body and content type for an upstream with no destination URL
///
/// Chosen from `Accept`, falling back to the request's `Content-Type`.
pub(crate) fn canned_response(
    upstream_id: &str,
    request_headers: &HeaderMap,
) -> (&'static str, String) {
    let header_value = |name: header::HeaderName| {
        request_headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let accept = header_value(header::ACCEPT);
    let content_type = header_value(header::CONTENT_TYPE);

    let wants_json = media_type_is(accept.as_deref(), "application/json")
        || (accept.is_none() && media_type_is(content_type.as_deref(), "application/json"));
    let wants_html = media_type_is(accept.as_deref(), "text/html");

    if wants_json {
        let body = serde_json::json!({
            "ok": true,
            "upstream": upstream_id,
            "message": "captured by llmtap; no upstream destination configured",
        });
        ("application/json", body.to_string())
    } else if wants_html {
        (
            "text/html; charset=utf-8",
            format!(
                "<!doctype html><html><body><p>Captured by llmtap for <code>{}</code>. No upstream destination configured.</p></body></html>",
                upstream_id
            ),
        )
    } else {
        (
            "text/plain; charset=utf-8",
            format!(
                "captured by llmtap for {}; no upstream destination configured\n",
                upstream_id
            ),
        )
    }
}
