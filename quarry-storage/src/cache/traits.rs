//! Tier traits.
//!
//! Both tiers are injected into the orchestrator behind these traits, so the
//! LMDB and Postgres adapters can be swapped for in-memory doubles in tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use quarry_core::{CacheKey, MarketRecord, QualityScore, QuarryResult, RecordKind, Timestamp};

use super::freshness::{CachedBatch, Freshness};

/// Fast embedded key/value tier.
///
/// One value per cache key; a write replaces the whole batch. `updated_at`
/// is stamped `max(now, previous + 1ms)` so it strictly increases per key,
/// and `created_at` survives overwrites.
#[async_trait]
pub trait LocalTier: Send + Sync + 'static {
    /// Read a batch. `Freshness::IgnoreTtl` returns expired data too.
    async fn get(&self, key: &CacheKey, freshness: Freshness) -> QuarryResult<Option<CachedBatch>>;

    /// Replace the batch stored under `key`. Returns the new `updated_at`.
    async fn put(
        &self,
        key: &CacheKey,
        records: &[MarketRecord],
        quality: Option<&QualityScore>,
    ) -> QuarryResult<Timestamp>;

    /// Remove `key`. Returns whether anything was removed.
    async fn delete(&self, key: &CacheKey) -> QuarryResult<bool>;

    async fn stats(&self) -> QuarryResult<CacheStats>;

    async fn ping(&self) -> QuarryResult<()>;

    /// Flush pending writes to disk. No-op for tiers without one.
    async fn flush(&self) -> QuarryResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Date-range filter for the durable tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DurableScope {
    pub entity_id: String,
    pub kind: RecordKind,
    /// Collection within the kind, e.g. `daily` vs `weekly` bars.
    pub variant: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DurableScope {
    pub fn new(entity_id: impl Into<String>, kind: RecordKind, variant: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            variant: variant.into(),
            start: None,
            end: None,
        }
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }

    /// Whether every date `other` can match is inside this scope, for the
    /// same entity, kind and variant. An open bound covers anything; a
    /// closed bound never covers an open one.
    pub fn covers(&self, other: &DurableScope) -> bool {
        let start_ok = match (self.start, other.start) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => mine <= theirs,
        };
        let end_ok = match (self.end, other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => mine >= theirs,
        };
        self.entity_id == other.entity_id
            && self.kind == other.kind
            && self.variant == other.variant
            && start_ok
            && end_ok
    }
}

/// Durable per-record document tier.
///
/// Rows belong to the cache key that wrote them, one row per
/// `(kind, entity_id, as_of)` within a key. A write replaces the key's whole
/// row set atomically, so `get` returns exactly the last batch stored under
/// the key and `delete` never touches rows owned by another key.
///
/// A write may also record the key's extent: the scope its batch is known to
/// cover. `query` answers only from a key whose extent covers the requested
/// scope. Freshness is judged on the owning key's last write.
#[async_trait]
pub trait DurableTier: Send + Sync + 'static {
    /// The batch last written under `key`.
    async fn get(&self, key: &CacheKey, freshness: Freshness) -> QuarryResult<Option<CachedBatch>>;

    /// Rows inside `scope`, taken from the most recently written key whose
    /// extent covers it. `None` when no extent covers the scope.
    async fn query(
        &self,
        scope: &DurableScope,
        freshness: Freshness,
    ) -> QuarryResult<Option<CachedBatch>>;

    /// Replace the rows owned by `key`. `extent` records the scope the batch
    /// covers; `None` drops any extent the key had. Returns rows written.
    async fn put(
        &self,
        key: &CacheKey,
        records: &[MarketRecord],
        extent: Option<&DurableScope>,
    ) -> QuarryResult<u64>;

    /// Remove the rows and extent owned by `key`. Returns rows removed.
    async fn delete(&self, key: &CacheKey) -> QuarryResult<u64>;

    async fn ping(&self) -> QuarryResult<()>;

    /// Release connections. Later calls fail as unavailable.
    async fn close(&self) {}

    fn name(&self) -> &'static str;
}

/// Statistics about local tier usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Reads served with the TTL ignored.
    pub stale_hits: u64,
    pub entry_count: u64,
    /// Approximate bytes written.
    pub size_bytes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Collapse rows into a batch, or `None` when the newest row fails
/// `freshness`. Rows must already be ordered by `as_of`.
pub(crate) fn batch_from_rows(
    rows: Vec<(MarketRecord, Timestamp, Timestamp)>,
    freshness: Freshness,
    now: Timestamp,
) -> Option<CachedBatch> {
    let created_at = rows.iter().map(|(_, created, _)| *created).min()?;
    let updated_at = rows.iter().map(|(_, _, updated)| *updated).max()?;
    if !freshness.admits(updated_at, now) {
        return None;
    }
    Some(CachedBatch {
        records: rows.into_iter().map(|(record, _, _)| record).collect(),
        created_at,
        updated_at,
        quality: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_scope_contains() {
        let d = |m, day| NaiveDate::from_ymd_opt(2023, m, day).unwrap();
        let scope = DurableScope::new("AAPL", RecordKind::Bar, "daily")
            .between(Some(d(1, 1)), Some(d(6, 30)));
        assert!(scope.contains(d(1, 1)));
        assert!(scope.contains(d(6, 30)));
        assert!(!scope.contains(d(7, 1)));

        let open = DurableScope::new("AAPL", RecordKind::Bar, "daily");
        assert!(open.contains(d(12, 31)));
    }

    #[test]
    fn test_scope_covers() {
        let d = |m, day| NaiveDate::from_ymd_opt(2023, m, day).unwrap();
        let open = DurableScope::new("AAPL", RecordKind::Bar, "daily");
        let june = open.clone().between(Some(d(6, 1)), Some(d(6, 30)));
        let mid_june = open.clone().between(Some(d(6, 10)), Some(d(6, 20)));
        let from_june = open.clone().between(Some(d(6, 1)), None);

        assert!(open.covers(&june));
        assert!(open.covers(&open));
        assert!(june.covers(&mid_june));
        assert!(!june.covers(&open));
        assert!(!june.covers(&from_june));
        assert!(!mid_june.covers(&june));
        assert!(from_june.covers(&mid_june));

        let weekly = DurableScope::new("AAPL", RecordKind::Bar, "weekly");
        assert!(!weekly.covers(&june));
        let msft = DurableScope::new("MSFT", RecordKind::Bar, "daily");
        assert!(!msft.covers(&june));
    }
}
