//! Proxy error types and response handling
//!
//! Only failures that happen before the upstream response starts flowing are
//! client-visible. Everything after that is handled by the capture pipeline.

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

use crate::parser::WireFormat;

/// Errors that can occur during proxying
#[derive(Debug)]
pub enum ProxyError {
    /// Upstream requires a proxy credential and none was sent
    MissingCredential,
    /// Proxy credential did not match any configured key
    AccessDenied,
    /// No routing configuration for the requested identifier
    UnknownUpstream(String),
    BodyRead(String),
    /// Could not reach the configured destination
    Upstream(String),
    /// Input and output wire formats differ; translation is not implemented
    ConversionNotImplemented {
        input: WireFormat,
        output: WireFormat,
    },
    ResponseBuild(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::AccessDenied => StatusCode::UNAUTHORIZED,
            Self::UnknownUpstream(_) => StatusCode::NOT_FOUND,
            Self::BodyRead(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::ConversionNotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::ResponseBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error type for the JSON body
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::AccessDenied => "access_denied",
            Self::UnknownUpstream(_) => "unknown_upstream",
            Self::BodyRead(_) => "body_read_error",
            Self::Upstream(_) => "upstream_error",
            Self::ConversionNotImplemented { .. } => "conversion_not_implemented",
            Self::ResponseBuild(_) => "response_build_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::MissingCredential => "missing proxy credential".to_string(),
            Self::AccessDenied => "access denied".to_string(),
            Self::UnknownUpstream(id) => format!("no upstream configured for '{}'", id),
            Self::BodyRead(msg) => format!("failed to read request body: {}", msg),
            Self::Upstream(msg) => format!("upstream request failed: {}", msg),
            Self::ConversionNotImplemented { input, output } => format!(
                "conversion from {} to {} is not implemented",
                input, output
            ),
            Self::ResponseBuild(msg) => format!("failed to build response: {}", msg),
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.status())
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        match &self {
            Self::MissingCredential | Self::AccessDenied | Self::UnknownUpstream(_) => {
                tracing::info!(status = %status, "Request rejected: {}", self.message());
            }
            _ => tracing::error!(status = %status, "Proxy error: {}", self.message()),
        }

        let body = json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
            }
        });

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ProxyError::MissingCredential.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyError::AccessDenied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProxyError::UnknownUpstream("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ProxyError::BodyRead("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::Upstream("x".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::ResponseBuild("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_conversion_error_names_both_formats() {
        let response = ProxyError::ConversionNotImplemented {
            input: WireFormat::Anthropic,
            output: WireFormat::OpenaiResponses,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "conversion_not_implemented");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("anthropic"));
        assert!(message.contains("openai_responses"));
    }
}
