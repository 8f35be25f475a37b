//! Config serialization to TOML
//!
//! Single source of truth for config file format.

use super::{Config, HeaderPriority};

/// Render a string as a quoted TOML value
fn quoted(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}

/// Render a table key, quoting it unless it is a bare TOML key
fn table_key(id: &str) -> String {
    let bare = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        id.to_string()
    } else {
        quoted(id)
    }
}

impl Config {
    /// Serialize upstreams to TOML sections
    pub(super) fn upstreams_to_toml(&self) -> String {
        if self.upstreams.is_empty() {
            // Show example comments when no upstreams configured
            return r#"
# [upstreams.anthropic]
# base_url = "https://api.anthropic.com"
# input_format = "anthropic"
# keys = ["team-secret"]       # Require x-llmtap-key; empty list = open access
#
# [[upstreams.anthropic.headers]]
# name = "x-api-key"
# value_env = "ANTHROPIC_API_KEY"
# priority = "high"            # low: add if absent, high: always override
"#
            .to_string();
        }

        let mut output = String::from("\n");
        // BTreeMap keeps sections in deterministic order
        for (id, upstream) in &self.upstreams {
            let id = table_key(id);
            output.push_str(&format!("[upstreams.{}]\n", id));
            match &upstream.base_url {
                Some(url) => output.push_str(&format!("base_url = {}\n", quoted(url))),
                None => output.push_str("# base_url unset: answer with a canned response\n"),
            }
            output.push_str(&format!(
                "input_format = \"{}\"\n",
                upstream.input_format.as_str()
            ));
            if let Some(output_format) = upstream.output_format {
                output.push_str(&format!("output_format = \"{}\"\n", output_format.as_str()));
            }
            if upstream.keep_auth_headers {
                output.push_str("keep_auth_headers = true\n");
            }
            if !upstream.keys.is_empty() {
                let keys: Vec<String> = upstream.keys.iter().map(|k| quoted(k)).collect();
                output.push_str(&format!("keys = [{}]\n", keys.join(", ")));
            }

            for header in &upstream.headers {
                output.push_str(&format!("\n[[upstreams.{}.headers]]\n", id));
                output.push_str(&format!("name = {}\n", quoted(&header.name)));
                if let Some(value) = &header.value {
                    output.push_str(&format!("value = {}\n", quoted(value)));
                }
                if let Some(value_env) = &header.value_env {
                    output.push_str(&format!("value_env = {}\n", quoted(value_env)));
                }
                if header.priority != HeaderPriority::Low {
                    output.push_str(&format!("priority = \"{}\"\n", header.priority.as_str()));
                }
            }
            output.push('\n');
        }
        output
    }

    /// Serialize config to TOML string (single source of truth for format)
    pub fn to_toml(&self) -> String {
        format!(
            r#"# llmtap configuration

# Proxy bind address (LLMTAP_BIND overrides)
bind_addr = "{bind}"

# Logging configuration (RUST_LOG env var overrides level)
[logging]
level = {log_level}
json = {log_json}            # JSON lines on stdout
# File logging (in addition to stdout)
file_enabled = {log_file_enabled}
file_dir = {log_file_dir}
file_rotation = "{log_file_rotation}"  # hourly, daily, never
file_prefix = {log_file_prefix}

# Where captured exchanges are persisted
[storage]
backend = "{storage_backend}"  # sqlite, jsonl
db_path = {storage_db_path}    # LLMTAP_DB_PATH overrides
log_dir = {storage_log_dir}    # LLMTAP_LOG_DIR overrides
pool_size = {storage_pool_size}

# ─────────────────────────────────────────────────────────────────────────────
# PRICING (Optional)
# ─────────────────────────────────────────────────────────────────────────────
# JSON keyed by model id. Each entry is either a quote
#   {{ "input": 3, "output": 15, "cache_read": 0.3, "cache_write": 3.75, "provider": "anthropic" }}
# or a table of quotes keyed by model id (the outer key becomes the provider).
# Prices are USD per million tokens. LLMTAP_PRICING_URL overrides url.
[pricing]
enabled = {pricing_enabled}
url = {pricing_url}
ttl_secs = {pricing_ttl}
fetch_timeout_secs = {pricing_timeout}
retry_after_secs = {pricing_retry}

# Capture pipeline
[capture]
mask_pii = {capture_mask_pii}            # Redact IP addresses in stored headers
preview_max_bytes = {capture_preview}
request_timeout_secs = {capture_timeout}

# ─────────────────────────────────────────────────────────────────────────────
# UPSTREAMS
# ─────────────────────────────────────────────────────────────────────────────
# Requests to http://<bind_addr>/<id>/<path> are forwarded to <base_url>/<path>.
# input_format: anthropic, openai_responses
{upstreams_section}"#,
            bind = self.bind_addr,
            log_level = quoted(&self.logging.level),
            log_json = self.logging.json,
            log_file_enabled = self.logging.file_enabled,
            log_file_dir = quoted(&self.logging.file_dir.display().to_string()),
            log_file_rotation = self.logging.file_rotation.as_str(),
            log_file_prefix = quoted(&self.logging.file_prefix),
            storage_backend = self.storage.backend.as_str(),
            storage_db_path = quoted(&self.storage.db_path.display().to_string()),
            storage_log_dir = quoted(&self.storage.log_dir.display().to_string()),
            storage_pool_size = self.storage.pool_size,
            pricing_enabled = self.pricing.enabled,
            pricing_url = quoted(&self.pricing.url),
            pricing_ttl = self.pricing.ttl_secs,
            pricing_timeout = self.pricing.fetch_timeout_secs,
            pricing_retry = self.pricing.retry_after_secs,
            capture_mask_pii = self.capture.mask_pii,
            capture_preview = self.capture.preview_max_bytes,
            capture_timeout = self.capture.request_timeout_secs,
            upstreams_section = self.upstreams_to_toml(),
        )
    }

    /// One line per upstream, for `llmtap upstreams`
    pub fn describe_upstreams(&self) -> Vec<String> {
        self.upstreams
            .values()
            .map(|u| {
                let formats = match u.output_format {
                    Some(out) if out != u.input_format => {
                        format!("{} -> {}", u.input_format, out)
                    }
                    _ => u.input_format.to_string(),
                };
                let destination = u.base_url.as_deref().unwrap_or("(canned response)");
                let access = if u.keys.is_empty() { "open" } else { "keyed" };
                format!("{:<16} {:<34} {:<6} {}", u.id, formats, access, destination)
            })
            .collect()
    }
}

