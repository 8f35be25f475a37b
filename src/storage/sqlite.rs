//! SQLite exchange store
//!
//! Writes go through an r2d2 pool and run on the blocking thread pool so a
//! slow disk never stalls the async runtime.

use anyhow::{Context, Result};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use std::path::Path;

use super::{ExchangeRecord, ExchangeStore};

const SCHEMA_VERSION: i32 = 1;

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database and bootstrap its schema
    pub fn open(db_path: impl AsRef<Path>, pool_size: u32) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout=5000;"));
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .context("Failed to build SQLite pool")?;

        let conn = pool.get().context("Failed to open SQLite connection")?;
        init_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), "SQLite store opened");

        Ok(Self { pool })
    }
}

/// Initialize database schema with WAL mode and run migrations
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )?;

    let has_metadata: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'metadata')",
        [],
        |row| row.get(0),
    )?;
    let current_version: i32 = if has_metadata {
        conn.query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                0
            )",
            [],
            |row| row.get(0),
        )?
    } else {
        0
    };

    if current_version < 1 {
        apply_schema_v1(conn)?;
    }
    if current_version > SCHEMA_VERSION {
        tracing::warn!(
            found = current_version,
            supported = SCHEMA_VERSION,
            "database schema is newer than this build"
        );
    }
    Ok(())
}

/// Initial schema (v1)
fn apply_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS exchanges (
            id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            upstream TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            ttfb_ms INTEGER,
            duration_ms INTEGER NOT NULL,
            request_headers TEXT NOT NULL,
            response_headers TEXT NOT NULL,
            request_body_size INTEGER NOT NULL,
            response_body_size INTEGER NOT NULL,
            request_body TEXT,
            response_body TEXT,
            streamed INTEGER NOT NULL DEFAULT 0,
            client_disconnected INTEGER NOT NULL DEFAULT 0,
            body_truncated INTEGER NOT NULL DEFAULT 0,
            conversation TEXT,
            conversation_error TEXT,
            model TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            cache_read_tokens INTEGER,
            cache_write_tokens INTEGER,
            price_usd REAL,
            price_provider TEXT,
            preview_user TEXT,
            preview_assistant TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_exchanges_started_at ON exchanges(started_at);
        CREATE INDEX IF NOT EXISTS idx_exchanges_upstream ON exchanges(upstream);
        CREATE INDEX IF NOT EXISTS idx_exchanges_model ON exchanges(model);

        INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '1');
        "#,
    )?;
    Ok(())
}

fn insert_record(conn: &Connection, record: &ExchangeRecord) -> Result<()> {
    let request_headers = serde_json::to_string(&record.request_headers)?;
    let response_headers = serde_json::to_string(&record.response_headers)?;
    let conversation = record
        .conversation
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let usage = record.usage.as_ref();

    conn.execute(
        "INSERT INTO exchanges (
            id, started_at, upstream, method, url, status, ttfb_ms, duration_ms,
            request_headers, response_headers, request_body_size, response_body_size,
            request_body, response_body, streamed, client_disconnected, body_truncated,
            conversation, conversation_error, model,
            input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
            price_usd, price_provider, preview_user, preview_assistant
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
            ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28
        )",
        params![
            record.id,
            record.started_at.to_rfc3339(),
            record.upstream,
            record.method,
            record.url,
            record.status as i64,
            record.ttfb_ms.map(|v| v as i64),
            record.duration_ms as i64,
            request_headers,
            response_headers,
            record.request_body_size as i64,
            record.response_body_size as i64,
            record.request_body,
            record.response_body,
            record.streamed,
            record.client_disconnected,
            record.body_truncated,
            conversation,
            record.conversation_error,
            record.model(),
            usage.map(|u| u.input_tokens as i64),
            usage.map(|u| u.output_tokens as i64),
            usage.and_then(|u| u.cache_read_tokens).map(|v| v as i64),
            usage.and_then(|u| u.cache_write_tokens).map(|v| v as i64),
            record.price.as_ref().map(|p| p.cost_usd),
            record.price.as_ref().map(|p| p.quote.provider.as_str()),
            record.preview.last_user,
            record.preview.last_assistant,
        ],
    )
    .context("Failed to insert exchange")?;
    Ok(())
}

#[async_trait]
impl ExchangeStore for SqliteStore {
    async fn persist(&self, record: &ExchangeRecord) -> Result<String> {
        let pool = self.pool.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let conn = pool.get().context("Failed to get SQLite connection")?;
            insert_record(&conn, &record)?;
            Ok(record.id)
        })
        .await
        .context("SQLite write task panicked")?
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{PriceEstimate, PriceQuote};
    use crate::storage::tests::sample_record;

    #[tokio::test]
    async fn test_persist_writes_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("data/llmtap.db"), 2).unwrap();

        let mut record = sample_record("rec-1");
        record.price = Some(PriceEstimate {
            quote: PriceQuote {
                input_per_million: 3.0,
                output_per_million: 15.0,
                cache_read_per_million: None,
                cache_write_per_million: None,
                provider: "anthropic".to_string(),
            },
            cost_usd: 0.5,
        });
        assert_eq!(store.persist(&record).await.unwrap(), "rec-1");

        let conn = store.pool.get().unwrap();
        let (model, input, price, preview): (String, i64, f64, String) = conn
            .query_row(
                "SELECT model, input_tokens, price_usd, preview_user FROM exchanges WHERE id = ?1",
                ["rec-1"],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();
        assert_eq!(model, "claude-x");
        assert_eq!(input, 5);
        assert_eq!(price, 0.5);
        assert_eq!(preview, "hi");
    }

    #[tokio::test]
    async fn test_schema_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llmtap.db");
        {
            let store = SqliteStore::open(&path, 1).unwrap();
            store.persist(&sample_record("a")).await.unwrap();
        }
        let store = SqliteStore::open(&path, 1).unwrap();
        store.persist(&sample_record("b")).await.unwrap();

        let conn = store.pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM exchanges", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        let version: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "1");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("llmtap.db"), 1).unwrap();
        store.persist(&sample_record("same")).await.unwrap();
        assert!(store.persist(&sample_record("same")).await.is_err());
    }
}
