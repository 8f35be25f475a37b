//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/llmtap/config.toml, or $LLMTAP_CONFIG)
//! 3. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod capture;
mod observability;
mod routing;
mod serialization;


// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (maintain public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use capture::{CaptureConfig, FileCapture, FilePricing, PricingConfig};
pub use observability::{
    FileLogging, FileStorage, LogRotation, LoggingConfig, StorageBackend, StorageConfig,
};
pub use routing::{
    ConfigRouting, FileHeaderDirective, FileUpstream, HeaderDirective, HeaderPriority,
    RoutingConfig, RoutingLookup,
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default proxy listen address
pub const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 8787);

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub bind_addr: SocketAddr,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Where captured exchanges are persisted
    pub storage: StorageConfig,

    /// Price index settings
    pub pricing: PricingConfig,

    /// Capture pipeline settings
    pub capture: CaptureConfig,

    /// Routing identifier -> upstream routing
    pub upstreams: BTreeMap<String, RoutingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR,
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            pricing: PricingConfig::default(),
            capture: CaptureConfig::default(),
            upstreams: routing::default_upstreams(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [storage] section
    pub storage: Option<FileStorage>,

    /// Optional [pricing] section
    pub pricing: Option<FilePricing>,

    /// Optional [capture] section
    pub capture: Option<FileCapture>,

    /// Optional [upstreams.X] sections; absent means the built-in upstreams
    pub upstreams: Option<BTreeMap<String, FileUpstream>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: $LLMTAP_CONFIG, else ~/.config/llmtap/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LLMTAP_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|p| p.join(".config").join("llmtap").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        // Use Config::default().to_toml() as single source of truth
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Rewrite the config file from defaults
    pub fn reset_config_file() -> Result<PathBuf> {
        let path = Self::config_path().context("Cannot determine config file path")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(&path, Self::default().to_toml())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Load file config if it exists
    ///
    /// Exits the process if the config file exists but cannot be parsed.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                    eprintln!("║  CONFIG ERROR - Failed to parse configuration file          ║");
                    eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  Tip: Check for:\n");
                    eprintln!("    - Missing quotes around string values");
                    eprintln!("    - Invalid boolean values (use true/false)");
                    eprintln!("    - Unknown wire formats (use anthropic/openai_responses)");
                    eprintln!("    - Typos in section names\n");
                    eprintln!("  To reset, run `llmtap config --reset`.\n");
                    std::process::exit(1);
                }
            },
            // Config file doesn't exist - use defaults
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file              ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: file -> env vars -> defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_file(Self::load_file_config())?;
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults (no environment overrides)
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(contents).context("Invalid config TOML")?;
        Self::from_file(file)
    }

    pub(crate) fn from_file(file: FileConfig) -> Result<Self> {
        let bind_addr = match file.bind_addr {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("Invalid bind address: {}", addr))?,
            None => DEFAULT_BIND_ADDR,
        };

        let upstreams = match file.upstreams {
            Some(upstreams) => upstreams
                .into_iter()
                .map(|(id, upstream)| {
                    let routing = RoutingConfig::from_file(&id, upstream);
                    (id, routing)
                })
                .collect(),
            None => routing::default_upstreams(),
        };

        Ok(Self {
            bind_addr,
            logging: LoggingConfig::from_file(file.logging),
            storage: StorageConfig::from_file(file.storage),
            pricing: PricingConfig::from_file(file.pricing),
            capture: CaptureConfig::from_file(file.capture),
            upstreams,
        })
    }

    /// Environment variables override file values
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("LLMTAP_BIND") {
            self.bind_addr = addr
                .parse()
                .with_context(|| format!("Invalid LLMTAP_BIND address: {}", addr))?;
        }
        if let Ok(dir) = std::env::var("LLMTAP_LOG_DIR") {
            self.storage.log_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("LLMTAP_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("LLMTAP_PRICING_URL") {
            self.pricing.url = url;
            self.pricing.enabled = true;
        }
        if let Ok(value) = std::env::var("LLMTAP_MASK_PII") {
            self.capture.mask_pii = value == "1" || value.eq_ignore_ascii_case("true");
        }
        Ok(())
    }
}
