//! Durable persistence for memory records and raw history
//!
//! Memory records are keyed by the flat address query; raw history is an
//! unbounded append-only log that outlives the bounded buffer.

use crate::address::{AddressQuery, ContextAddress};
use crate::error::RelayError;
use crate::memory::record::{MemoryRecord, Turn, TurnRole};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

/// Derive the store primary key from a flat address query
pub fn query_key(query: &AddressQuery) -> String {
    query
        .values()
        .cloned()
        .collect::<Vec<_>>()
        .join(":")
}

/// Persistence boundary consumed by the memory core.
///
/// All operations are idempotent from the caller's perspective for the same
/// input; any I/O failure surfaces as `StoreUnavailable`, never a silent drop.
#[async_trait::async_trait]
pub trait MemoryStore: Send + Sync {
    /// Most recent record matching the query, or absent
    async fn get(&self, query: &AddressQuery) -> Result<Option<MemoryRecord>>;

    /// Overwrite the single logical record for this query
    async fn upsert_one(&self, query: &AddressQuery, record: &MemoryRecord) -> Result<()>;

    /// Append to the unbounded raw history for this address
    async fn append_raw_turn(&self, address: &ContextAddress, turn: &Turn) -> Result<()>;
}

/// In-memory store for development and tests
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<String, MemoryRecord>>>,
    raw_log: Arc<RwLock<HashMap<String, Vec<Turn>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            raw_log: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Raw history recorded for an address (test/inspection helper)
    pub async fn raw_history(&self, address: &ContextAddress) -> Vec<Turn> {
        let log = self.raw_log.read().await;
        log.get(&query_key(&address.as_query()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, query: &AddressQuery) -> Result<Option<MemoryRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&query_key(query)).cloned())
    }

    async fn upsert_one(&self, query: &AddressQuery, record: &MemoryRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(query_key(query), record.clone());
        Ok(())
    }

    async fn append_raw_turn(&self, address: &ContextAddress, turn: &Turn) -> Result<()> {
        let mut log = self.raw_log.write().await;
        log.entry(query_key(&address.as_query()))
            .or_insert_with(Vec::new)
            .push(turn.clone());
        Ok(())
    }
}

/// Postgres-backed store
pub struct PgMemoryStore {
    pool: sqlx::PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgMemoryStore {
    /// Build a store over a lazily connected pool
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                RelayError::StoreUnavailable(format!("Failed to configure postgres pool: {}", e))
            })?;

        info!("Memory store backend: postgres");

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_memory (
                      canonical_key TEXT PRIMARY KEY,
                      query JSONB NOT NULL,
                      data JSONB NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_raw_log (
                      entry_id BIGSERIAL PRIMARY KEY,
                      canonical_key TEXT NOT NULL,
                      role TEXT NOT NULL,
                      content TEXT NOT NULL,
                      source_message_id TEXT,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_conversation_raw_log_key_time
                    ON conversation_raw_log (canonical_key, created_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                RelayError::StoreUnavailable(format!(
                    "Failed to initialize memory store schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    fn role_to_db(role: TurnRole) -> &'static str {
        match role {
            TurnRole::Human => "human",
            TurnRole::Assistant => "assistant",
        }
    }
}

#[async_trait::async_trait]
impl MemoryStore for PgMemoryStore {
    async fn get(&self, query: &AddressQuery) -> Result<Option<MemoryRecord>> {
        use sqlx::Row;

        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT data FROM conversation_memory WHERE canonical_key = $1",
        )
        .bind(query_key(query))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RelayError::StoreUnavailable(format!("Failed to load memory record: {}", e))
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let data: serde_json::Value = row.try_get("data").map_err(|e| {
            RelayError::StoreUnavailable(format!("Malformed memory record row: {}", e))
        })?;

        let record = serde_json::from_value(data)?;
        Ok(Some(record))
    }

    async fn upsert_one(&self, query: &AddressQuery, record: &MemoryRecord) -> Result<()> {
        self.ensure_schema().await?;

        let query_json = serde_json::to_value(query)?;
        let data_json = serde_json::to_value(record)?;

        sqlx::query(
            r#"
            INSERT INTO conversation_memory (canonical_key, query, data, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (canonical_key)
            DO UPDATE SET query = EXCLUDED.query, data = EXCLUDED.data, updated_at = NOW()
            "#,
        )
        .bind(query_key(query))
        .bind(query_json)
        .bind(data_json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RelayError::StoreUnavailable(format!("Failed to upsert memory record: {}", e))
        })?;

        Ok(())
    }

    async fn append_raw_turn(&self, address: &ContextAddress, turn: &Turn) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO conversation_raw_log
              (canonical_key, role, content, source_message_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(query_key(&address.as_query()))
        .bind(Self::role_to_db(turn.role))
        .bind(&turn.content)
        .bind(&turn.source_message_id)
        .bind(turn.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RelayError::StoreUnavailable(format!("Failed to append raw turn: {}", e))
        })?;

        Ok(())
    }
}
