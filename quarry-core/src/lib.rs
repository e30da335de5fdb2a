//! QUARRY Core - Market Data Types
//!
//! Pure data structures shared by the storage and service crates: tagged
//! market records, cache keys, coverage metadata, the record-quality scorer,
//! clocks, configuration and errors. Nothing in here performs I/O.

pub mod cache_key;
pub mod clock;
pub mod config;
pub mod coverage;
pub mod enums;
pub mod error;
pub mod health;
pub mod quality;
pub mod record;

use chrono::{DateTime, Utc};
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Identifier for persisted metadata rows (UUIDv7, timestamp-sortable).
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId.
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use cache_key::{CacheKey, MAX_STORED_KEY_LEN};
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::{CachePolicy, DbConfig, LocalTierConfig, QuarryConfig, RefreshPolicy};
pub use coverage::{CoverageRecord, RefreshPlan};
pub use enums::{DataType, Granularity, ReadStatus, RecordKind, Tier, UpdateType};
pub use error::{
    ConfigError, CoverageError, QuarryError, QuarryResult, RefreshError, TierError,
    ValidationWarning,
};
pub use health::{overall_status, HealthCheck, HealthStatus};
pub use quality::{QualityIssue, QualityRule, QualityRules, QualityScore, QualityScorer, QualityWeights};
pub use record::{
    date_span, EconomicObservation, FundamentalRecord, MarketRecord, NewsArticle, PriceBar,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_are_v7() {
        let a = new_entity_id();
        let b = new_entity_id();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 7);
    }
}
