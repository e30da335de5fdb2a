//! Error types for QUARRY operations

use crate::{DataType, Tier};
use thiserror::Error;

/// Storage tier errors.
///
/// Any of these is treated as a miss for the tier that raised it; the
/// orchestrator keeps going with the next tier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierError {
    #[error("{tier:?} tier unavailable: {reason}")]
    Unavailable { tier: Tier, reason: String },

    #[error("Serialization failed for {tier:?} tier: {reason}")]
    Serialization { tier: Tier, reason: String },

    #[error("Deserialization failed for {tier:?} tier: {reason}")]
    Deserialization { tier: Tier, reason: String },

    #[error("I/O error in {tier:?} tier: {reason}")]
    Io { tier: Tier, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl TierError {
    /// Shorthand for the most common failure: the tier cannot be reached.
    pub fn unavailable(tier: Tier, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            tier,
            reason: reason.into(),
        }
    }
}

/// Refresh errors. The refresh closure supplied by a domain service
/// either produced nothing usable or failed outright.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Provider call failed: {reason}")]
    Provider { reason: String },

    #[error("Provider returned no records")]
    Empty,

    #[error("Refresh was cancelled before completing")]
    Cancelled,
}

impl RefreshError {
    pub fn provider(reason: impl Into<String>) -> Self {
        Self::Provider {
            reason: reason.into(),
        }
    }
}

/// Advisory data-quality warning. Never blocks a write.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Quality score {score:.1} below threshold {threshold:.1} for {cache_key} ({issue_count} issues)")]
pub struct ValidationWarning {
    pub cache_key: String,
    pub score: f64,
    pub threshold: f64,
    pub issue_count: usize,
}

/// Coverage bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoverageError {
    #[error("Coverage record not found for {entity_id}/{data_type}")]
    NotFound {
        entity_id: String,
        data_type: DataType,
    },

    #[error("Coverage store failed: {reason}")]
    StoreFailed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all QUARRY errors.
#[derive(Debug, Clone, Error)]
pub enum QuarryError {
    #[error("Tier error: {0}")]
    Tier(#[from] TierError),

    #[error("Refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Coverage error: {0}")]
    Coverage(#[from] CoverageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for QUARRY operations.
pub type QuarryResult<T> = Result<T, QuarryError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_error_display_unavailable() {
        let err = TierError::unavailable(Tier::Durable, "connection refused");
        let msg = format!("{}", err);
        assert!(msg.contains("Durable"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_refresh_error_display() {
        let msg = format!("{}", RefreshError::provider("HTTP 503"));
        assert!(msg.contains("Provider call failed"));
        assert!(msg.contains("503"));
        assert!(format!("{}", RefreshError::Empty).contains("no records"));
    }

    #[test]
    fn test_validation_warning_display() {
        let warning = ValidationWarning {
            cache_key: "AAPL:daily".to_string(),
            score: 42.0,
            threshold: 60.0,
            issue_count: 3,
        };
        let msg = format!("{}", warning);
        assert!(msg.contains("42.0"));
        assert!(msg.contains("AAPL:daily"));
        assert!(msg.contains("3 issues"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "cache.local_ttl".to_string(),
            value: "0s".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("cache.local_ttl"));
        assert!(msg.contains("0s"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_quarry_error_from_variants() {
        let tier = QuarryError::from(TierError::LockPoisoned);
        assert!(matches!(tier, QuarryError::Tier(_)));

        let refresh = QuarryError::from(RefreshError::Empty);
        assert!(matches!(refresh, QuarryError::Refresh(_)));

        let coverage = QuarryError::from(CoverageError::StoreFailed {
            reason: "pool closed".to_string(),
        });
        assert!(matches!(coverage, QuarryError::Coverage(_)));

        let config = QuarryError::from(ConfigError::MissingRequired {
            field: "durable.host".to_string(),
        });
        assert!(matches!(config, QuarryError::Config(_)));
    }
}
