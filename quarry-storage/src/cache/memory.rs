//! In-memory tier doubles.
//!
//! Same semantics as the LMDB and Postgres adapters, minus persistence.
//! Both can be switched offline to simulate an unreachable tier.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta};
use quarry_core::{
    CacheKey, MarketRecord, QualityScore, QuarryResult, RecordKind, SharedClock, Tier, TierError,
    Timestamp,
};

use super::freshness::{CachedBatch, Freshness};
use super::traits::{batch_from_rows, CacheStats, DurableScope, DurableTier, LocalTier};

/// Next `updated_at` for a key: now, but never at or before the previous one.
pub(crate) fn next_stamp(previous: Option<Timestamp>, now: Timestamp) -> Timestamp {
    match previous {
        Some(prev) if prev >= now => prev + TimeDelta::milliseconds(1),
        _ => now,
    }
}

// ============================================================================
// LOCAL TIER
// ============================================================================

/// `HashMap`-backed local tier.
#[derive(Debug)]
pub struct MemoryLocalTier {
    entries: RwLock<HashMap<String, CachedBatch>>,
    stats: RwLock<CacheStats>,
    offline: AtomicBool,
    clock: SharedClock,
}

impl MemoryLocalTier {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            offline: AtomicBool::new(false),
            clock,
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> QuarryResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TierError::unavailable(Tier::Local, "memory tier offline").into());
        }
        Ok(())
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

#[async_trait]
impl LocalTier for MemoryLocalTier {
    async fn get(&self, key: &CacheKey, freshness: Freshness) -> QuarryResult<Option<CachedBatch>> {
        self.check_online()?;
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| TierError::LockPoisoned)?;

        match entries.get(&key.storage_key()) {
            Some(batch) if freshness.admits(batch.updated_at, now) => {
                let within_ttl = Freshness::IgnoreTtl != freshness;
                self.record(|s| {
                    if within_ttl {
                        s.hits += 1;
                    } else {
                        s.stale_hits += 1;
                    }
                });
                Ok(Some(batch.clone()))
            }
            _ => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        key: &CacheKey,
        records: &[MarketRecord],
        quality: Option<&QualityScore>,
    ) -> QuarryResult<Timestamp> {
        self.check_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| TierError::LockPoisoned)?;

        let storage_key = key.storage_key();
        let previous = entries.get(&storage_key);
        let created_at = previous.map_or(now, |b| b.created_at);
        let updated_at = next_stamp(previous.map(|b| b.updated_at), now);
        let is_new = previous.is_none();

        entries.insert(
            storage_key,
            CachedBatch {
                records: records.to_vec(),
                created_at,
                updated_at,
                quality: quality.cloned(),
            },
        );
        drop(entries);

        self.record(|s| {
            if is_new {
                s.entry_count += 1;
            }
        });
        Ok(updated_at)
    }

    async fn delete(&self, key: &CacheKey) -> QuarryResult<bool> {
        self.check_online()?;
        let removed = self
            .entries
            .write()
            .map_err(|_| TierError::LockPoisoned)?
            .remove(&key.storage_key())
            .is_some();
        if removed {
            self.record(|s| s.entry_count = s.entry_count.saturating_sub(1));
        }
        Ok(removed)
    }

    async fn stats(&self) -> QuarryResult<CacheStats> {
        Ok(self.stats.read().map_err(|_| TierError::LockPoisoned)?.clone())
    }

    async fn ping(&self) -> QuarryResult<()> {
        self.check_online()
    }

    fn name(&self) -> &'static str {
        "memory-local"
    }
}

// ============================================================================
// DURABLE TIER
// ============================================================================

/// Identity of a row within the key that owns it.
type RowKey = (RecordKind, String, Timestamp);

#[derive(Debug, Clone)]
struct DocumentRow {
    as_of_date: NaiveDate,
    document: MarketRecord,
    created_at: Timestamp,
    updated_at: Timestamp,
}

/// Everything one cache key owns.
#[derive(Debug, Clone)]
struct KeyedRows {
    rows: BTreeMap<RowKey, DocumentRow>,
    extent: Option<DurableScope>,
    updated_at: Timestamp,
}

/// `HashMap`-backed durable document store.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    keys: RwLock<HashMap<String, KeyedRows>>,
    offline: AtomicBool,
    clock: SharedClock,
}

impl MemoryDocumentStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            clock,
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Rows across every key.
    pub fn row_count(&self) -> usize {
        self.keys
            .read()
            .map(|keys| keys.values().map(|k| k.rows.len()).sum())
            .unwrap_or(0)
    }

    fn check_online(&self) -> QuarryResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TierError::unavailable(Tier::Durable, "memory store offline").into());
        }
        Ok(())
    }

    fn collect<'a>(
        &self,
        rows: impl Iterator<Item = &'a DocumentRow>,
        freshness: Freshness,
    ) -> Option<CachedBatch> {
        let mut matched: Vec<_> = rows
            .map(|row| (row.document.clone(), row.created_at, row.updated_at))
            .collect();
        matched.sort_by_key(|(record, _, _)| record.as_of());
        batch_from_rows(matched, freshness, self.clock.now())
    }
}

#[async_trait]
impl DurableTier for MemoryDocumentStore {
    async fn get(&self, key: &CacheKey, freshness: Freshness) -> QuarryResult<Option<CachedBatch>> {
        self.check_online()?;
        let keys = self.keys.read().map_err(|_| TierError::LockPoisoned)?;
        Ok(keys
            .get(&key.storage_key())
            .and_then(|owned| self.collect(owned.rows.values(), freshness)))
    }

    async fn query(
        &self,
        scope: &DurableScope,
        freshness: Freshness,
    ) -> QuarryResult<Option<CachedBatch>> {
        self.check_online()?;
        let keys = self.keys.read().map_err(|_| TierError::LockPoisoned)?;
        let covering = keys
            .values()
            .filter(|owned| owned.extent.as_ref().is_some_and(|e| e.covers(scope)))
            .max_by_key(|owned| owned.updated_at);

        Ok(covering.and_then(|owned| {
            let inside = owned.rows.iter().filter(|((kind, entity_id, _), row)| {
                *kind == scope.kind && *entity_id == scope.entity_id && scope.contains(row.as_of_date)
            });
            self.collect(inside.map(|(_, row)| row), freshness)
        }))
    }

    async fn put(
        &self,
        key: &CacheKey,
        records: &[MarketRecord],
        extent: Option<&DurableScope>,
    ) -> QuarryResult<u64> {
        self.check_online()?;
        let now = self.clock.now();
        let storage_key = key.storage_key();
        let mut keys = self.keys.write().map_err(|_| TierError::LockPoisoned)?;
        let previous = keys.remove(&storage_key);

        let mut rows = BTreeMap::new();
        for record in records {
            let row_key = (record.kind(), record.entity_id().to_string(), record.as_of());
            let created_at = previous
                .as_ref()
                .and_then(|p| p.rows.get(&row_key))
                .map_or(now, |row| row.created_at);
            rows.insert(
                row_key,
                DocumentRow {
                    as_of_date: record.as_of_date(),
                    document: record.clone(),
                    created_at,
                    updated_at: now,
                },
            );
        }

        let written = rows.len() as u64;
        if !rows.is_empty() {
            keys.insert(
                storage_key,
                KeyedRows {
                    rows,
                    extent: extent.cloned(),
                    updated_at: now,
                },
            );
        }
        Ok(written)
    }

    async fn delete(&self, key: &CacheKey) -> QuarryResult<u64> {
        self.check_online()?;
        let mut keys = self.keys.write().map_err(|_| TierError::LockPoisoned)?;
        Ok(keys
            .remove(&key.storage_key())
            .map_or(0, |owned| owned.rows.len() as u64))
    }

    async fn ping(&self) -> QuarryResult<()> {
        self.check_online()
    }

    fn name(&self) -> &'static str {
        "memory-durable"
    }
}
