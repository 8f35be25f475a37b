//! Proxy credential checks
//!
//! Clients present a proxy key in `x-llmtap-key`. The header is checked here
//! and never forwarded upstream.

use async_trait::async_trait;

use crate::config::RoutingConfig;
use crate::util::sha256_hex;

/// Header carrying the proxy credential
pub const CREDENTIAL_HEADER: &str = "x-llmtap-key";

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    /// Keys are configured but no credential was presented
    Missing,
    Deny,
}

/// Decides whether a credential may use an upstream
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, credential: Option<&str>, routing: &RoutingConfig) -> AuthDecision;
}

/// Accepts credentials listed in the upstream's `keys`
///
/// An upstream with no keys is open. Comparison is on SHA-256 digests, so the
/// presented credential is never compared byte-by-byte against a stored key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyAuthorizer;

#[async_trait]
impl Authorizer for KeyAuthorizer {
    async fn authorize(&self, credential: Option<&str>, routing: &RoutingConfig) -> AuthDecision {
        if routing.keys.is_empty() {
            return AuthDecision::Allow;
        }
        let Some(credential) = credential.filter(|c| !c.is_empty()) else {
            return AuthDecision::Missing;
        };

        let presented = sha256_hex(credential);
        if routing.keys.iter().any(|key| sha256_hex(key) == presented) {
            AuthDecision::Allow
        } else {
            AuthDecision::Deny
        }
    }
}
