// Storage module - persists captured exchanges
//
// Two backends share the `ExchangeStore` trait:
// - `SqliteStore`: one row per exchange in a WAL-mode database
// - `JsonlStore`: JSON Lines, one object per line, one file per session
//
// JSON Lines makes it easy to:
// - Stream process large files
// - Grep/search with standard tools
// - Parse with jq or other JSON tools
//
// Example: jq '.preview.lastUser' logs/llmtap-20251127-143022-a7b3.jsonl

pub mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{StorageBackend, StorageConfig};
use crate::conversation::preview::Preview;
use crate::conversation::{Conversation, Usage};
use crate::pricing::PriceEstimate;
use crate::sanitize::CapturedHeaders;
pub use sqlite::SqliteStore;

/// Everything persisted about one proxied exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    pub id: String,
    /// Routing identifier the request came in on
    pub upstream: String,
    pub method: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub status: u16,
    /// Time until response headers arrived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<u64>,
    /// Time until the response body was fully drained
    pub duration_ms: u64,

    pub request_headers: CapturedHeaders,
    pub response_headers: CapturedHeaders,

    /// Sizes as transmitted (possibly compressed)
    pub request_body_size: usize,
    pub response_body_size: usize,
    /// Decompressed bodies, when they are valid UTF-8
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,

    pub streamed: bool,
    pub client_disconnected: bool,
    pub body_truncated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<PriceEstimate>,
    pub preview: Preview,
}

impl ExchangeRecord {
    /// Model used for the exchange, when a conversation was parsed
    pub fn model(&self) -> Option<&str> {
        self.conversation
            .as_ref()
            .map(|c| c.models.effective())
            .filter(|m| !m.is_empty())
    }
}

/// Persistence collaborator for captured exchanges
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    /// Persist one record, returning its id
    async fn persist(&self, record: &ExchangeRecord) -> Result<String>;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

/// Open the configured storage backend
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn ExchangeStore>> {
    let store: Arc<dyn ExchangeStore> = match config.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(&config.db_path, config.pool_size)?),
        StorageBackend::Jsonl => Arc::new(JsonlStore::new(config.log_dir.clone(), session_id())?),
    };
    tracing::info!(backend = store.backend(), "Storage ready");
    Ok(store)
}

/// Session id for log file names: YYYYMMDD-HHMMSS-XXXX
pub fn session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..4])
}

/// Handles writing records to JSON Lines files
pub struct JsonlStore {
    log_path: PathBuf,
    // Serializes appends so concurrent records never interleave within a line
    write_lock: Arc<Mutex<()>>,
}

impl JsonlStore {
    /// Create a new JSONL store
    /// Each session gets its own log file based on session_id
    pub fn new(log_dir: PathBuf, session_id: String) -> Result<Self> {
        // Create the log directory if it doesn't exist
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let log_path = log_dir.join(format!("llmtap-{}.jsonl", session_id));
        tracing::info!("Session log: {:?}", log_path);

        Ok(Self {
            log_path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Path to this session's log file
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

#[async_trait]
impl ExchangeStore for JsonlStore {
    async fn persist(&self, record: &ExchangeRecord) -> Result<String> {
        let mut line = serde_json::to_string(record).context("Failed to serialize record")?;
        line.push('\n');

        let log_path = self.log_path.clone();
        let write_lock = Arc::clone(&self.write_lock);
        tokio::task::spawn_blocking(move || -> Result<()> {
            // Taken on the blocking thread so a cancelled caller cannot release it mid-write
            let _guard = write_lock.blocking_lock();

            // Open file in append mode, create if it doesn't exist
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .context("Failed to open log file")?;

            file.write_all(line.as_bytes())
                .context("Failed to write to log file")?;

            // Flush immediately so logs are visible even if process crashes
            file.flush().context("Failed to flush log file")
        })
        .await
        .context("JSONL write task panicked")??;

        Ok(record.id.clone())
    }

    fn backend(&self) -> &'static str {
        "jsonl"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conversation::{Message, Models, Role};

    /// In-memory store for pipeline tests
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) records: std::sync::Mutex<Vec<ExchangeRecord>>,
        /// Records a failing store was handed and refused
        pub(crate) rejected: std::sync::Mutex<Vec<ExchangeRecord>>,
        fail: bool,
    }

    impl MemoryStore {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub(crate) fn records(&self) -> Vec<ExchangeRecord> {
            self.records.lock().unwrap().clone()
        }

        /// Wait until at least `count` records have been persisted
        pub(crate) async fn wait_for(&self, count: usize) -> Vec<ExchangeRecord> {
            Self::wait_on(&self.records, count).await
        }

        /// Wait until at least `count` persist calls have been refused
        pub(crate) async fn wait_for_rejected(&self, count: usize) -> Vec<ExchangeRecord> {
            Self::wait_on(&self.rejected, count).await
        }

        async fn wait_on(
            list: &std::sync::Mutex<Vec<ExchangeRecord>>,
            count: usize,
        ) -> Vec<ExchangeRecord> {
            for _ in 0..200 {
                let records = list.lock().unwrap().clone();
                if records.len() >= count {
                    return records;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {} store calls", count);
        }
    }

    #[async_trait]
    impl ExchangeStore for MemoryStore {
        async fn persist(&self, record: &ExchangeRecord) -> Result<String> {
            if self.fail {
                self.rejected.lock().unwrap().push(record.clone());
                anyhow::bail!("store unavailable");
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(record.id.clone())
        }

        fn backend(&self) -> &'static str {
            "memory"
        }
    }

    /// A fully populated record for store tests
    pub(crate) fn sample_record(id: &str) -> ExchangeRecord {
        ExchangeRecord {
            id: id.to_string(),
            upstream: "anthropic".to_string(),
            method: "POST".to_string(),
            url: "https://api.example.com/v1/messages".to_string(),
            started_at: Utc::now(),
            status: 200,
            ttfb_ms: Some(12),
            duration_ms: 40,
            request_headers: CapturedHeaders(vec![(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            response_headers: CapturedHeaders::default(),
            request_body_size: 10,
            response_body_size: 20,
            request_body: Some("{}".to_string()),
            response_body: None,
            streamed: false,
            client_disconnected: false,
            body_truncated: false,
            conversation: Some(Conversation {
                messages: vec![Message::text(Role::User, "hi")],
                models: Models {
                    request: "claude-x".to_string(),
                    response: None,
                },
                ..Default::default()
            }),
            conversation_error: None,
            usage: Some(Usage {
                input_tokens: 5,
                output_tokens: 7,
                cache_read_tokens: None,
                cache_write_tokens: None,
            }),
            price: None,
            preview: Preview {
                last_user: Some("hi".to_string()),
                last_assistant: None,
            },
        }
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs"), "test-session".to_string()).unwrap();

        assert_eq!(store.persist(&sample_record("a")).await.unwrap(), "a");
        assert_eq!(store.persist(&sample_record("b")).await.unwrap(), "b");

        let contents = fs::read_to_string(store.log_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], "a");
        assert_eq!(first["preview"]["lastUser"], "hi");
        assert_eq!(first["conversation"]["models"]["request"], "claude-x");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jsonl_store_concurrent_appends_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonlStore::new(dir.path().to_path_buf(), "concurrent".to_string()).unwrap(),
        );

        let writes = (0..32).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.persist(&sample_record(&format!("r{}", i))).await })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }

        let contents = fs::read_to_string(store.log_path()).unwrap();
        let mut ids: Vec<String> = contents
            .lines()
            .map(|line| {
                let record: serde_json::Value = serde_json::from_str(line).unwrap();
                record["id"].as_str().unwrap().to_string()
            })
            .collect();
        ids.sort();
        let mut expected: Vec<String> = (0..32).map(|i| format!("r{}", i)).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_session_id_shape() {
        let id = session_id();
        assert_eq!(id.len(), "20251127-143022-a7b3".len());
        assert_eq!(id.matches('-').count(), 2);
    }

    #[test]
    fn test_record_model_uses_effective_model() {
        let record = sample_record("x");
        assert_eq!(record.model(), Some("claude-x"));
    }
}
