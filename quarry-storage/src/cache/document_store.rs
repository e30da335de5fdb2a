//! Postgres JSONB document store, the durable tier.
//!
//! `market_documents` holds one row per record, keyed by
//! `(cache_key, kind, entity_id, as_of)` so every row belongs to the key
//! that wrote it. The full record is kept as JSONB; `as_of_date` is split
//! out for date-range scans. `market_extents` holds, per key, the scope its
//! rows cover; scoped reads only answer from a covering extent.
//!
//! Timestamps come from the injected clock rather than `now()` so TTL
//! decisions agree with the rest of the process.

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use quarry_core::{
    CacheKey, DbConfig, MarketRecord, QuarryResult, SharedClock, Tier, TierError, Timestamp,
};
use serde_json::Value as JsonValue;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use super::freshness::{CachedBatch, Freshness};
use super::traits::{batch_from_rows, DurableScope, DurableTier};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS market_documents (
    cache_key   TEXT        NOT NULL,
    kind        TEXT        NOT NULL,
    entity_id   TEXT        NOT NULL,
    as_of       TIMESTAMPTZ NOT NULL,
    as_of_date  DATE        NOT NULL,
    document    JSONB       NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (cache_key, kind, entity_id, as_of)
);
CREATE INDEX IF NOT EXISTS market_documents_date_idx
    ON market_documents (cache_key, as_of_date);

CREATE TABLE IF NOT EXISTS market_extents (
    cache_key   TEXT        PRIMARY KEY,
    kind        TEXT        NOT NULL,
    entity_id   TEXT        NOT NULL,
    variant     TEXT        NOT NULL,
    start_date  DATE,
    end_date    DATE,
    updated_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS market_extents_scope_idx
    ON market_extents (kind, entity_id, variant);
"#;

const SELECT_CREATED: &str = r#"
SELECT kind, entity_id, as_of, created_at
FROM market_documents
WHERE cache_key = $1
"#;

const DELETE_ROWS: &str = "DELETE FROM market_documents WHERE cache_key = $1";

const DELETE_EXTENT: &str = "DELETE FROM market_extents WHERE cache_key = $1";

const INSERT: &str = r#"
INSERT INTO market_documents
    (cache_key, kind, entity_id, as_of, as_of_date, document, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (cache_key, kind, entity_id, as_of) DO UPDATE SET
    as_of_date = EXCLUDED.as_of_date,
    document   = EXCLUDED.document,
    updated_at = EXCLUDED.updated_at
"#;

const UPSERT_EXTENT: &str = r#"
INSERT INTO market_extents
    (cache_key, kind, entity_id, variant, start_date, end_date, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (cache_key) DO UPDATE SET
    kind       = EXCLUDED.kind,
    entity_id  = EXCLUDED.entity_id,
    variant    = EXCLUDED.variant,
    start_date = EXCLUDED.start_date,
    end_date   = EXCLUDED.end_date,
    updated_at = EXCLUDED.updated_at
"#;

const SELECT_BY_KEY: &str = r#"
SELECT document, created_at, updated_at
FROM market_documents
WHERE cache_key = $1
ORDER BY as_of
"#;

/// Most recently written extent covering `[$4, $5]`. A NULL bound on the
/// extent is open; a NULL bound on the request only matches an open extent.
const SELECT_COVERING_EXTENT: &str = r#"
SELECT cache_key
FROM market_extents
WHERE kind = $1 AND entity_id = $2 AND variant = $3
  AND (start_date IS NULL OR ($4::date IS NOT NULL AND start_date <= $4))
  AND (end_date IS NULL OR ($5::date IS NOT NULL AND end_date >= $5))
ORDER BY updated_at DESC
LIMIT 1
"#;

const SELECT_IN_SCOPE: &str = r#"
SELECT document, created_at, updated_at
FROM market_documents
WHERE cache_key = $1 AND kind = $2 AND entity_id = $3
  AND ($4::date IS NULL OR as_of_date >= $4)
  AND ($5::date IS NULL OR as_of_date <= $5)
ORDER BY as_of
"#;

/// Build a connection pool from configuration.
pub fn create_pool(config: &DbConfig) -> QuarryResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.dbname.clone());
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.connect_timeout = Some(config.timeout);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_size));

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| unavailable(format!("failed to create pool: {}", e)))?;
    Ok(pool)
}

fn unavailable(reason: impl Into<String>) -> TierError {
    TierError::unavailable(Tier::Durable, reason)
}

fn io(e: tokio_postgres::Error) -> TierError {
    TierError::Io {
        tier: Tier::Durable,
        reason: e.to_string(),
    }
}

fn decode_row(row: &Row) -> Result<(MarketRecord, Timestamp, Timestamp), TierError> {
    let document: JsonValue = row.try_get(0).map_err(io)?;
    let created_at: Timestamp = row.try_get(1).map_err(io)?;
    let updated_at: Timestamp = row.try_get(2).map_err(io)?;
    let record = serde_json::from_value(document).map_err(|e| TierError::Deserialization {
        tier: Tier::Durable,
        reason: e.to_string(),
    })?;
    Ok((record, created_at, updated_at))
}

/// Postgres-backed durable tier.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: Pool,
    clock: SharedClock,
}

impl PgDocumentStore {
    pub fn new(pool: Pool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub fn from_config(config: &DbConfig, clock: SharedClock) -> QuarryResult<Self> {
        Ok(Self::new(create_pool(config)?, clock))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn get_conn(&self) -> Result<deadpool_postgres::Object, TierError> {
        self.pool
            .get()
            .await
            .map_err(|e| unavailable(e.to_string()))
    }

    /// Create the document and extent tables and indexes if missing.
    pub async fn ensure_schema(&self) -> QuarryResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(SCHEMA).await.map_err(io)?;
        info!("market_documents and market_extents schema ready");
        Ok(())
    }

    fn collect(&self, rows: Vec<Row>, freshness: Freshness) -> QuarryResult<Option<CachedBatch>> {
        let decoded = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batch_from_rows(decoded, freshness, self.clock.now()))
    }
}

#[async_trait]
impl DurableTier for PgDocumentStore {
    async fn get(&self, key: &CacheKey, freshness: Freshness) -> QuarryResult<Option<CachedBatch>> {
        let conn = self.get_conn().await?;
        let rows = conn
            .query(SELECT_BY_KEY, &[&key.storage_key()])
            .await
            .map_err(io)?;
        self.collect(rows, freshness)
    }

    async fn query(
        &self,
        scope: &DurableScope,
        freshness: Freshness,
    ) -> QuarryResult<Option<CachedBatch>> {
        let conn = self.get_conn().await?;
        let kind = scope.kind.as_str();
        let covering = conn
            .query_opt(
                SELECT_COVERING_EXTENT,
                &[&kind, &scope.entity_id, &scope.variant, &scope.start, &scope.end],
            )
            .await
            .map_err(io)?;
        let Some(extent) = covering else {
            return Ok(None);
        };
        let cache_key: String = extent.try_get(0).map_err(io)?;

        let rows = conn
            .query(
                SELECT_IN_SCOPE,
                &[&cache_key, &kind, &scope.entity_id, &scope.start, &scope.end],
            )
            .await
            .map_err(io)?;
        self.collect(rows, freshness)
    }

    async fn put(
        &self,
        key: &CacheKey,
        records: &[MarketRecord],
        extent: Option<&DurableScope>,
    ) -> QuarryResult<u64> {
        let now = self.clock.now();
        let storage_key = key.storage_key();

        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(io)?;

        let mut created: HashMap<(String, String, Timestamp), Timestamp> = HashMap::new();
        for row in tx.query(SELECT_CREATED, &[&storage_key]).await.map_err(io)? {
            let kind: String = row.try_get(0).map_err(io)?;
            let entity_id: String = row.try_get(1).map_err(io)?;
            let as_of: Timestamp = row.try_get(2).map_err(io)?;
            let created_at: Timestamp = row.try_get(3).map_err(io)?;
            created.insert((kind, entity_id, as_of), created_at);
        }
        tx.execute(DELETE_ROWS, &[&storage_key]).await.map_err(io)?;

        let stmt = tx.prepare_cached(INSERT).await.map_err(io)?;
        let mut written = 0u64;
        for record in records {
            let document = serde_json::to_value(record).map_err(|e| TierError::Serialization {
                tier: Tier::Durable,
                reason: e.to_string(),
            })?;
            let kind = record.kind().as_str();
            let created_at = created
                .get(&(kind.to_string(), record.entity_id().to_string(), record.as_of()))
                .copied()
                .unwrap_or(now);
            written += tx
                .execute(
                    &stmt,
                    &[
                        &storage_key,
                        &kind,
                        &record.entity_id(),
                        &record.as_of(),
                        &record.as_of_date(),
                        &document,
                        &created_at,
                        &now,
                    ],
                )
                .await
                .map_err(io)?;
        }

        match extent {
            Some(scope) if written > 0 => {
                tx.execute(
                    UPSERT_EXTENT,
                    &[
                        &storage_key,
                        &scope.kind.as_str(),
                        &scope.entity_id,
                        &scope.variant,
                        &scope.start,
                        &scope.end,
                        &now,
                    ],
                )
                .await
                .map_err(io)?;
            }
            _ => {
                tx.execute(DELETE_EXTENT, &[&storage_key]).await.map_err(io)?;
            }
        }
        tx.commit().await.map_err(io)?;

        debug!(cache_key = %key, rows = written, scoped = extent.is_some(), "replaced durable documents");
        Ok(written)
    }

    async fn delete(&self, key: &CacheKey) -> QuarryResult<u64> {
        let storage_key = key.storage_key();
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(io)?;
        let removed = tx.execute(DELETE_ROWS, &[&storage_key]).await.map_err(io)?;
        tx.execute(DELETE_EXTENT, &[&storage_key]).await.map_err(io)?;
        tx.commit().await.map_err(io)?;
        Ok(removed)
    }

    async fn ping(&self) -> QuarryResult<()> {
        let conn = self.get_conn().await?;
        conn.simple_query("SELECT 1").await.map_err(io)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
