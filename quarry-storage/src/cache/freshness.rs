//! Freshness contracts and read results.
//!
//! Callers state how stale they are willing to go with [`Freshness`]; reads
//! come back as a [`CacheResponse`] that says which tier answered and
//! whether the answer is degraded.

use quarry_core::clock::elapsed;
use quarry_core::{MarketRecord, QualityScore, ReadStatus, Tier, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Staleness tolerance for a tier read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Only data stored within the given age.
    Within(Duration),
    /// Any stored data, however old. Used for deliberate stale fallback.
    IgnoreTtl,
}

impl Freshness {
    pub fn within(ttl: Duration) -> Self {
        Self::Within(ttl)
    }

    /// Whether data stored at `stored_at` satisfies this requirement at `now`.
    pub fn admits(&self, stored_at: Timestamp, now: Timestamp) -> bool {
        match self {
            Self::Within(ttl) => elapsed(stored_at, now) <= *ttl,
            Self::IgnoreTtl => true,
        }
    }
}

/// A record batch as held by a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBatch {
    pub records: Vec<MarketRecord>,
    pub created_at: Timestamp,
    /// Last successful write. Strictly increases per key.
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityScore>,
}

impl CachedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of an orchestrated read. Never an error.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResponse {
    pub records: Vec<MarketRecord>,
    /// `None` only when nothing could be served.
    pub tier: Option<Tier>,
    pub status: ReadStatus,
    pub stored_at: Option<Timestamp>,
    pub quality: Option<QualityScore>,
}

impl CacheResponse {
    pub fn fresh(tier: Tier, batch: CachedBatch) -> Self {
        Self {
            records: batch.records,
            tier: Some(tier),
            status: ReadStatus::Fresh,
            stored_at: Some(batch.updated_at),
            quality: batch.quality,
        }
    }

    pub fn stale(batch: CachedBatch) -> Self {
        Self {
            records: batch.records,
            tier: Some(Tier::Local),
            status: ReadStatus::Stale,
            stored_at: Some(batch.updated_at),
            quality: batch.quality,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            records: Vec::new(),
            tier: None,
            status: ReadStatus::Unavailable,
            stored_at: None,
            quality: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.status == ReadStatus::Stale
    }

    /// True for anything other than a fresh answer.
    pub fn is_degraded(&self) -> bool {
        self.status != ReadStatus::Fresh
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<MarketRecord> {
        self.records
    }
}
