//! LMDB-backed local tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped
//! key/value table. Keys are the rendered cache key (hashed past LMDB's
//! 511-byte limit), values are JSON-encoded [`CachedBatch`]es.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The tier uses:
//! - Read transactions for `get`
//! - A single write transaction per `put` / `delete`, so the read of the
//!   previous `updated_at` and the overwrite are atomic
//! - Statistics behind an `RwLock`

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use quarry_core::{
    CacheKey, MarketRecord, QualityScore, QuarryError, QuarryResult, SharedClock, Tier, TierError,
    Timestamp,
};
use tracing::debug;

use super::freshness::{CachedBatch, Freshness};
use super::memory::next_stamp;
use super::traits::{CacheStats, LocalTier};

/// Error type for LMDB tier operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbTierError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbTierError> for QuarryError {
    fn from(e: LmdbTierError) -> Self {
        let tier = Tier::Local;
        let err = match e {
            LmdbTierError::Serialization(reason) => TierError::Serialization { tier, reason },
            LmdbTierError::Deserialization(reason) => TierError::Deserialization { tier, reason },
            LmdbTierError::Io(io) => TierError::Io {
                tier,
                reason: io.to_string(),
            },
            other => TierError::Unavailable {
                tier,
                reason: other.to_string(),
            },
        };
        QuarryError::Tier(err)
    }
}

fn txn_err(e: heed::Error) -> LmdbTierError {
    LmdbTierError::Transaction(e.to_string())
}

/// LMDB local tier.
///
/// # Example
///
/// ```ignore
/// let tier = LmdbLocalTier::new("/var/lib/quarry/lmdb", 1024, SystemClock::shared())?;
/// tier.put(&CacheKey::new("AAPL", "daily"), &records, None).await?;
/// ```
pub struct LmdbLocalTier {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
    clock: SharedClock,
}

impl LmdbLocalTier {
    /// Open (or create) the environment at `path` with a map of
    /// `max_size_mb` megabytes.
    pub fn new<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        clock: SharedClock,
    ) -> Result<Self, LmdbTierError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbTierError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbTierError::DbOpen(e.to_string()))?;
        let entry_count = db.len(&wtxn).map_err(txn_err)?;
        let mut size_bytes = 0u64;
        for entry in db.iter(&wtxn).map_err(txn_err)? {
            let (_, value) = entry.map_err(txn_err)?;
            size_bytes += value.len() as u64;
        }
        wtxn.commit().map_err(txn_err)?;

        debug!(path = %path.as_ref().display(), entry_count, size_bytes, "opened LMDB local tier");

        Ok(Self {
            env,
            db,
            stats: RwLock::new(CacheStats {
                entry_count,
                size_bytes,
                ..CacheStats::default()
            }),
            clock,
        })
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    fn decode(bytes: &[u8]) -> Result<CachedBatch, LmdbTierError> {
        serde_json::from_slice(bytes).map_err(|e| LmdbTierError::Deserialization(e.to_string()))
    }
}

#[async_trait]
impl LocalTier for LmdbLocalTier {
    async fn get(&self, key: &CacheKey, freshness: Freshness) -> QuarryResult<Option<CachedBatch>> {
        let storage_key = key.storage_key();
        let rtxn = self.env.read_txn().map_err(txn_err)?;

        let bytes = match self.db.get(&rtxn, storage_key.as_bytes()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.record(|s| s.misses += 1);
                return Ok(None);
            }
            Err(e) => {
                self.record(|s| s.misses += 1);
                return Err(txn_err(e).into());
            }
        };

        let batch = Self::decode(bytes)?;
        if !freshness.admits(batch.updated_at, self.clock.now()) {
            self.record(|s| s.misses += 1);
            return Ok(None);
        }

        match freshness {
            Freshness::IgnoreTtl => self.record(|s| s.stale_hits += 1),
            Freshness::Within(_) => self.record(|s| s.hits += 1),
        }
        Ok(Some(batch))
    }

    async fn put(
        &self,
        key: &CacheKey,
        records: &[MarketRecord],
        quality: Option<&QualityScore>,
    ) -> QuarryResult<Timestamp> {
        let storage_key = key.storage_key();
        let now = self.clock.now();

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let (previous, previous_len) =
            match self.db.get(&wtxn, storage_key.as_bytes()).map_err(txn_err)? {
                // A corrupt previous value is simply overwritten.
                Some(bytes) => (
                    Self::decode(bytes).ok().map(|b| (b.created_at, b.updated_at)),
                    Some(bytes.len() as u64),
                ),
                None => (None, None),
            };
        let is_new = previous_len.is_none();

        let batch = CachedBatch {
            records: records.to_vec(),
            created_at: previous.map_or(now, |(created, _)| created),
            updated_at: next_stamp(previous.map(|(_, updated)| updated), now),
            quality: quality.cloned(),
        };
        let value = serde_json::to_vec(&batch)
            .map_err(|e| LmdbTierError::Serialization(e.to_string()))?;

        self.db
            .put(&mut wtxn, storage_key.as_bytes(), &value)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        self.record(|s| {
            if is_new {
                s.entry_count += 1;
            }
            s.size_bytes = s.size_bytes.saturating_sub(previous_len.unwrap_or(0))
                + value.len() as u64;
        });
        Ok(batch.updated_at)
    }

    async fn delete(&self, key: &CacheKey) -> QuarryResult<bool> {
        let storage_key = key.storage_key();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let removed_len = self
            .db
            .get(&wtxn, storage_key.as_bytes())
            .map_err(txn_err)?
            .map(|bytes| bytes.len() as u64);
        let deleted = self
            .db
            .delete(&mut wtxn, storage_key.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        if deleted {
            self.record(|s| {
                s.entry_count = s.entry_count.saturating_sub(1);
                s.size_bytes = s.size_bytes.saturating_sub(removed_len.unwrap_or(0));
            });
        }
        Ok(deleted)
    }

    async fn stats(&self) -> QuarryResult<CacheStats> {
        Ok(self.stats.read().map(|s| s.clone()).unwrap_or_default())
    }

    async fn ping(&self) -> QuarryResult<()> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.db.len(&rtxn).map_err(txn_err)?;
        Ok(())
    }

    async fn flush(&self) -> QuarryResult<()> {
        self.env.force_sync().map_err(txn_err)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "lmdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use quarry_core::{Clock, MockClock, PriceBar};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_tier() -> (LmdbLocalTier, Arc<MockClock>, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = Arc::new(MockClock::new());
        let tier = LmdbLocalTier::new(temp_dir.path(), 10, clock.clone())
            .expect("tier creation should succeed");
        (tier, clock, temp_dir)
    }

    fn bars(n: u32) -> Vec<MarketRecord> {
        (1..=n)
            .map(|day| {
                MarketRecord::from(PriceBar {
                    symbol: "AAPL".to_string(),
                    timestamp: Utc.with_ymd_and_hms(2024, 1, day, 21, 0, 0).unwrap(),
                    open: Some(180.0),
                    high: Some(190.0),
                    low: Some(175.0),
                    close: Some(185.0),
                    volume: Some(1_000),
                    adjusted_close: None,
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (tier, clock, _dir) = create_test_tier();
        let key = CacheKey::new("AAPL", "daily");

        let stored_at = tier.put(&key, &bars(3), None).await.expect("put should succeed");
        assert_eq!(stored_at, clock.now());

        let batch = tier
            .get(&key, Freshness::within(Duration::from_secs(60)))
            .await
            .expect("get should succeed")
            .expect("batch should be present");
        assert_eq!(batch.records, bars(3));
        assert_eq!(batch.updated_at, stored_at);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (tier, _clock, _dir) = create_test_tier();
        let result = tier
            .get(&CacheKey::new("MSFT", "daily"), Freshness::IgnoreTtl)
            .await
            .expect("get should succeed");
        assert!(result.is_none());
        assert_eq!(tier.stats().await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_and_ignore_ttl() {
        let (tier, clock, _dir) = create_test_tier();
        let key = CacheKey::new("AAPL", "daily");
        tier.put(&key, &bars(1), None).await.unwrap();

        clock.advance(Duration::from_secs(7 * 3600));
        let six_hours = Freshness::within(Duration::from_secs(6 * 3600));
        assert!(tier.get(&key, six_hours).await.unwrap().is_none());
        assert!(tier.get(&key, Freshness::IgnoreTtl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_created_at() {
        let (tier, clock, _dir) = create_test_tier();
        let key = CacheKey::new("AAPL", "daily");

        let first = tier.put(&key, &bars(2), None).await.unwrap();
        clock.advance(Duration::from_secs(30));
        let second = tier.put(&key, &bars(1), None).await.unwrap();
        // Same instant: still strictly later.
        let third = tier.put(&key, &bars(1), None).await.unwrap();

        assert!(second > first);
        assert!(third > second);

        let batch = tier.get(&key, Freshness::IgnoreTtl).await.unwrap().unwrap();
        assert_eq!(batch.created_at, first);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(tier.stats().await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_quality_metadata_roundtrip() {
        let (tier, _clock, _dir) = create_test_tier();
        let key = CacheKey::new("AAPL", "daily");
        let quality = QualityScore::perfect();

        tier.put(&key, &bars(1), Some(&quality)).await.unwrap();
        let batch = tier.get(&key, Freshness::IgnoreTtl).await.unwrap().unwrap();
        assert_eq!(batch.quality, Some(quality));
    }

    #[tokio::test]
    async fn test_delete() {
        let (tier, _clock, _dir) = create_test_tier();
        let key = CacheKey::new("AAPL", "daily");
        tier.put(&key, &bars(1), None).await.unwrap();

        assert!(tier.delete(&key).await.unwrap());
        assert!(!tier.delete(&key).await.unwrap());
        assert!(tier.get(&key, Freshness::IgnoreTtl).await.unwrap().is_none());
        assert_eq!(tier.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_size_bytes_tracks_overwrite_and_delete() {
        let (tier, _clock, _dir) = create_test_tier();
        let key = CacheKey::new("AAPL", "daily");

        tier.put(&key, &bars(5), None).await.unwrap();
        let five = tier.stats().await.unwrap().size_bytes;
        assert!(five > 0);

        for _ in 0..3 {
            tier.put(&key, &bars(5), None).await.unwrap();
        }
        // Only the timestamps differ between overwrites.
        let rewritten = tier.stats().await.unwrap().size_bytes;
        assert!(rewritten < five + five / 2, "{rewritten} vs {five}");

        tier.put(&key, &bars(1), None).await.unwrap();
        let one = tier.stats().await.unwrap().size_bytes;
        assert!(one < five);

        let other = CacheKey::new("MSFT", "daily");
        tier.put(&other, &bars(1), None).await.unwrap();
        assert!(tier.delete(&key).await.unwrap());
        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.entry_count, 1);
        assert!(stats.size_bytes > 0 && stats.size_bytes < five);

        assert!(tier.delete(&other).await.unwrap());
        assert_eq!(tier.stats().await.unwrap().size_bytes, 0);
    }

    #[tokio::test]
    async fn test_long_key_is_hashed() {
        let (tier, _clock, _dir) = create_test_tier();
        let key = CacheKey::new("SERIES", "economic").with_param("ids", "X".repeat(700));
        tier.put(&key, &bars(1), None).await.expect("long key put should succeed");
        assert!(tier.get(&key, Freshness::IgnoreTtl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(MockClock::new());
        let key = CacheKey::new("AAPL", "daily");
        {
            let tier = LmdbLocalTier::new(temp_dir.path(), 10, clock.clone()).unwrap();
            tier.put(&key, &bars(2), None).await.unwrap();
            tier.flush().await.unwrap();
        }
        let tier = LmdbLocalTier::new(temp_dir.path(), 10, clock).unwrap();
        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.entry_count, 1);
        assert!(stats.size_bytes > 0);
        let batch = tier.get(&key, Freshness::IgnoreTtl).await.unwrap().unwrap();
        assert_eq!(batch.records, bars(2));
    }
}
