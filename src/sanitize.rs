// Header sanitization before persistence
//
// Rules per header, in order:
// 1. Credential-looking names (auth / key / token) get their whole value masked.
// 2. Other values have embedded JWTs and `Bearer <token>` tokens masked in place.
// 3. With PII masking on, IPv4/IPv6 literals are replaced with a marker.
//
// Masking keeps the first and last four characters of values longer than 12
// characters and replaces everything else with `***`. Every rule recognises its
// own output, so sanitizing twice is the same as sanitizing once.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Replacement for IP literals when PII masking is on
pub const IP_REDACTION: &str = "[REDACTED_IP]";

const MASK: &str = "***";
const KEEP_CHARS: usize = 4;
const MIN_PARTIAL_MASK_LEN: usize = 12;

/// Header-name fragments that mark a credential header
const SENSITIVE_NAME_FRAGMENTS: &[&str] = &["auth", "key", "token"];

static JWT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("valid JWT regex")
});

// The token class includes `*` so an already-masked token is matched whole
// and left alone instead of being re-masked piecewise.
static BEARER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer\s+)([A-Za-z0-9._~+/=*-]+)").expect("valid bearer regex")
});

// A bracketed literal (`[v6]:port`) is replaced brackets and all.
static IPV6_CANDIDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([0-9A-Fa-f:.]+)\]|[0-9A-Fa-f:.]{2,}").expect("valid ipv6 candidate regex")
});

// Matched on its own so a trailing `:port` does not hide the address.
static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("valid ipv4 regex")
});

/// Options controlling sanitization
#[derive(Debug, Clone, Copy, Default)]
pub struct SanitizeOptions {
    /// Replace IP address literals in header values
    pub mask_pii: bool,
}

/// Ordered list of lowercase header name/value pairs as captured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedHeaders(pub Vec<(String, String)>);

impl CapturedHeaders {
    /// Capture an http header map, lowercasing names and decoding values lossily
    pub fn from_header_map(headers: &axum::http::HeaderMap) -> Self {
        Self(
            headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_ascii_lowercase(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        )
    }

    /// First value for a header name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Sanitize every header independently
pub fn sanitize(headers: &CapturedHeaders, options: SanitizeOptions) -> CapturedHeaders {
    CapturedHeaders(
        headers
            .iter()
            .map(|(name, value)| (name.clone(), sanitize_value(name, value, options)))
            .collect(),
    )
}

/// Sanitize one header value given its name
pub fn sanitize_value(name: &str, value: &str, options: SanitizeOptions) -> String {
    let masked = if is_sensitive_name(name) {
        mask_secret(value)
    } else {
        mask_embedded_tokens(value)
    };

    if options.mask_pii {
        redact_ips(&masked)
    } else {
        masked
    }
}

fn is_sensitive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_NAME_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

/// Mask a secret, keeping 4 leading and 4 trailing characters when it is long enough
pub fn mask_secret(secret: &str) -> String {
    if is_masked(secret) {
        return secret.to_string();
    }
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > MIN_PARTIAL_MASK_LEN {
        let head: String = chars[..KEEP_CHARS].iter().collect();
        let tail: String = chars[chars.len() - KEEP_CHARS..].iter().collect();
        format!("{}{}{}", head, MASK, tail)
    } else {
        MASK.to_string()
    }
}

/// True for values produced by `mask_secret`
fn is_masked(value: &str) -> bool {
    if value == MASK {
        return true;
    }
    let chars: Vec<char> = value.chars().collect();
    chars.len() == KEEP_CHARS * 2 + MASK.len()
        && chars[KEEP_CHARS..KEEP_CHARS + MASK.len()]
            .iter()
            .all(|c| *c == '*')
}

fn mask_embedded_tokens(value: &str) -> String {
    let without_jwts = JWT_RE.replace_all(value, |caps: &Captures| mask_secret(&caps[0]));
    BEARER_RE
        .replace_all(&without_jwts, |caps: &Captures| {
            format!("{}{}", &caps[1], mask_secret(&caps[2]))
        })
        .into_owned()
}

/// IPv6 literals go first so an embedded IPv4 tail (`::ffff:1.2.3.4`) is
/// redacted with its address rather than leaving the prefix behind
fn redact_ips(value: &str) -> String {
    let without_v6 = IPV6_CANDIDATE_RE.replace_all(value, |caps: &Captures| {
        let inner = caps.get(1).map_or(&caps[0], |m| m.as_str());
        if is_ipv6_literal(inner) {
            IP_REDACTION.to_string()
        } else {
            caps[0].to_string()
        }
    });
    IPV4_RE
        .replace_all(&without_v6, |caps: &Captures| {
            if caps[0].parse::<Ipv4Addr>().is_ok() {
                IP_REDACTION.to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn is_ipv6_literal(candidate: &str) -> bool {
    candidate.matches(':').count() >= 2 && candidate.parse::<Ipv6Addr>().is_ok()
}
