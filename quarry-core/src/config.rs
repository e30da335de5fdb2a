//! Configuration types
//!
//! Every section has sane defaults, can be overridden from `QUARRY_*`
//! environment variables, or loaded from a TOML file. Durations are written
//! as whole seconds in TOML.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ConfigError, DataType, Granularity};

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod secs_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::DataType;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<DataType, Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (*k, v.as_secs()))
            .collect::<BTreeMap<_, _>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<DataType, Duration>, D::Error> {
        let raw = BTreeMap::<DataType, u64>::deserialize(d)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, Duration::from_secs(v)))
            .collect())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

fn positive(field: &str, d: Duration) -> Result<(), ConfigError> {
    if d.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", d),
            reason: format!("{} must be positive", field),
        });
    }
    Ok(())
}

// ============================================================================
// CACHE POLICY
// ============================================================================

/// TTLs and quality thresholds used by the orchestrator and services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Default local-tier TTL when a caller has no better value.
    #[serde(with = "secs")]
    pub local_ttl: Duration,
    /// Freshness window for durable-tier rows, judged by their `updated_at`.
    #[serde(with = "secs")]
    pub durable_ttl: Duration,
    /// Batches scoring below this are logged as a quality warning.
    pub quality_warning_threshold: f64,
    /// Newest record older than this halves the timeliness sub-score.
    #[serde(with = "secs")]
    pub quality_max_age: Duration,
    #[serde(with = "secs")]
    pub bars_ttl: Duration,
    #[serde(with = "secs")]
    pub intraday_ttl: Duration,
    #[serde(with = "secs")]
    pub fundamentals_ttl: Duration,
    #[serde(with = "secs")]
    pub economic_ttl: Duration,
    #[serde(with = "secs")]
    pub news_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            local_ttl: Duration::from_secs(6 * HOUR),
            durable_ttl: Duration::from_secs(6 * HOUR),
            quality_warning_threshold: 60.0,
            quality_max_age: Duration::from_secs(7 * DAY),
            bars_ttl: Duration::from_secs(6 * HOUR),
            intraday_ttl: Duration::from_secs(15 * 60),
            fundamentals_ttl: Duration::from_secs(7 * DAY),
            economic_ttl: Duration::from_secs(DAY),
            news_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl CachePolicy {
    /// Local TTL a service should use for a given data type.
    pub fn ttl_for(&self, data_type: DataType) -> Duration {
        match data_type {
            DataType::Intraday => self.intraday_ttl,
            DataType::Daily | DataType::Weekly | DataType::Monthly => self.bars_ttl,
            DataType::Fundamentals => self.fundamentals_ttl,
            DataType::Economic => self.economic_ttl,
            DataType::News => self.news_ttl,
        }
    }

    /// Environment variables (all in seconds unless noted):
    /// - `QUARRY_LOCAL_TTL_SECS`, `QUARRY_DURABLE_TTL_SECS`
    /// - `QUARRY_QUALITY_THRESHOLD` (score, 0-100)
    /// - `QUARRY_QUALITY_MAX_AGE_SECS`
    /// - `QUARRY_BARS_TTL_SECS`, `QUARRY_INTRADAY_TTL_SECS`,
    ///   `QUARRY_FUNDAMENTALS_TTL_SECS`, `QUARRY_ECONOMIC_TTL_SECS`,
    ///   `QUARRY_NEWS_TTL_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            local_ttl: env_secs("QUARRY_LOCAL_TTL_SECS").unwrap_or(defaults.local_ttl),
            durable_ttl: env_secs("QUARRY_DURABLE_TTL_SECS").unwrap_or(defaults.durable_ttl),
            quality_warning_threshold: env_parse("QUARRY_QUALITY_THRESHOLD")
                .unwrap_or(defaults.quality_warning_threshold),
            quality_max_age: env_secs("QUARRY_QUALITY_MAX_AGE_SECS")
                .unwrap_or(defaults.quality_max_age),
            bars_ttl: env_secs("QUARRY_BARS_TTL_SECS").unwrap_or(defaults.bars_ttl),
            intraday_ttl: env_secs("QUARRY_INTRADAY_TTL_SECS").unwrap_or(defaults.intraday_ttl),
            fundamentals_ttl: env_secs("QUARRY_FUNDAMENTALS_TTL_SECS")
                .unwrap_or(defaults.fundamentals_ttl),
            economic_ttl: env_secs("QUARRY_ECONOMIC_TTL_SECS").unwrap_or(defaults.economic_ttl),
            news_ttl: env_secs("QUARRY_NEWS_TTL_SECS").unwrap_or(defaults.news_ttl),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("cache.local_ttl", self.local_ttl)?;
        positive("cache.durable_ttl", self.durable_ttl)?;
        positive("cache.quality_max_age", self.quality_max_age)?;
        positive("cache.bars_ttl", self.bars_ttl)?;
        positive("cache.intraday_ttl", self.intraday_ttl)?;
        positive("cache.fundamentals_ttl", self.fundamentals_ttl)?;
        positive("cache.economic_ttl", self.economic_ttl)?;
        positive("cache.news_ttl", self.news_ttl)?;

        if !(0.0..=100.0).contains(&self.quality_warning_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "cache.quality_warning_threshold".to_string(),
                value: self.quality_warning_threshold.to_string(),
                reason: "quality_warning_threshold must be between 0 and 100".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// REFRESH POLICY
// ============================================================================

/// How long coverage stays valid before a full refresh is needed, and how
/// often a delta is fetched in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    #[serde(with = "secs")]
    pub fine: Duration,
    #[serde(with = "secs")]
    pub medium: Duration,
    #[serde(with = "secs")]
    pub coarse: Duration,
    /// Per data-type intervals that win over the granularity default.
    #[serde(with = "secs_map")]
    pub overrides: BTreeMap<DataType, Duration>,
    /// Delta cadence per granularity. Capped at the full-refresh interval.
    #[serde(with = "secs")]
    pub delta_fine: Duration,
    #[serde(with = "secs")]
    pub delta_medium: Duration,
    #[serde(with = "secs")]
    pub delta_coarse: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            fine: Duration::from_secs(7 * DAY),
            medium: Duration::from_secs(30 * DAY),
            coarse: Duration::from_secs(60 * DAY),
            overrides: BTreeMap::new(),
            delta_fine: Duration::from_secs(DAY),
            delta_medium: Duration::from_secs(7 * DAY),
            delta_coarse: Duration::from_secs(30 * DAY),
        }
    }
}

impl RefreshPolicy {
    /// Time between full refreshes.
    pub fn refresh_interval(&self, data_type: DataType) -> Duration {
        if let Some(interval) = self.overrides.get(&data_type) {
            return *interval;
        }
        match data_type.granularity() {
            Granularity::Fine => self.fine,
            Granularity::Medium => self.medium,
            Granularity::Coarse => self.coarse,
        }
    }

    /// Time from any successful update until the next delta is due. Never
    /// longer than the full-refresh interval.
    pub fn delta_interval(&self, data_type: DataType) -> Duration {
        let delta = match data_type.granularity() {
            Granularity::Fine => self.delta_fine,
            Granularity::Medium => self.delta_medium,
            Granularity::Coarse => self.delta_coarse,
        };
        delta.min(self.refresh_interval(data_type))
    }

    pub fn with_override(mut self, data_type: DataType, interval: Duration) -> Self {
        self.overrides.insert(data_type, interval);
        self
    }

    /// Environment variables:
    /// - `QUARRY_REFRESH_FINE_DAYS` (default: 7)
    /// - `QUARRY_REFRESH_MEDIUM_DAYS` (default: 30)
    /// - `QUARRY_REFRESH_COARSE_DAYS` (default: 60)
    /// - `QUARRY_REFRESH_<DATA_TYPE>_DAYS`, e.g. `QUARRY_REFRESH_NEWS_DAYS`
    /// - `QUARRY_DELTA_FINE_DAYS` (default: 1)
    /// - `QUARRY_DELTA_MEDIUM_DAYS` (default: 7)
    /// - `QUARRY_DELTA_COARSE_DAYS` (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let days = |name: &str| env_parse::<u64>(name).map(|d| Duration::from_secs(d * DAY));

        let overrides = DataType::ALL
            .into_iter()
            .filter_map(|dt| {
                let name = format!("QUARRY_REFRESH_{}_DAYS", dt.as_str().to_ascii_uppercase());
                days(&name).map(|interval| (dt, interval))
            })
            .collect();

        Self {
            fine: days("QUARRY_REFRESH_FINE_DAYS").unwrap_or(defaults.fine),
            medium: days("QUARRY_REFRESH_MEDIUM_DAYS").unwrap_or(defaults.medium),
            coarse: days("QUARRY_REFRESH_COARSE_DAYS").unwrap_or(defaults.coarse),
            overrides,
            delta_fine: days("QUARRY_DELTA_FINE_DAYS").unwrap_or(defaults.delta_fine),
            delta_medium: days("QUARRY_DELTA_MEDIUM_DAYS").unwrap_or(defaults.delta_medium),
            delta_coarse: days("QUARRY_DELTA_COARSE_DAYS").unwrap_or(defaults.delta_coarse),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("refresh.fine", self.fine)?;
        positive("refresh.medium", self.medium)?;
        positive("refresh.coarse", self.coarse)?;
        positive("refresh.delta_fine", self.delta_fine)?;
        positive("refresh.delta_medium", self.delta_medium)?;
        positive("refresh.delta_coarse", self.delta_coarse)?;
        for (dt, interval) in &self.overrides {
            positive(&format!("refresh.overrides.{}", dt), *interval)?;
        }
        Ok(())
    }
}

// ============================================================================
// TIER CONFIGURATION
// ============================================================================

/// LMDB environment settings for the local tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTierConfig {
    pub path: PathBuf,
    /// LMDB map size in megabytes.
    pub max_size_mb: usize,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/quarry-lmdb"),
            max_size_mb: 1024,
        }
    }
}

impl LocalTierConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: std::env::var("QUARRY_LMDB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            max_size_mb: env_parse("QUARRY_LMDB_MAX_SIZE_MB").unwrap_or(defaults.max_size_mb),
        }
    }
}

/// Postgres connection settings for the durable tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "quarry".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("QUARRY_DB_HOST").unwrap_or(defaults.host),
            port: env_parse("QUARRY_DB_PORT").unwrap_or(defaults.port),
            dbname: std::env::var("QUARRY_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("QUARRY_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("QUARRY_DB_PASSWORD").unwrap_or_default(),
            max_size: env_parse("QUARRY_DB_POOL_SIZE").unwrap_or(defaults.max_size),
            timeout: env_secs("QUARRY_DB_TIMEOUT").unwrap_or(defaults.timeout),
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarryConfig {
    pub cache: CachePolicy,
    pub refresh: RefreshPolicy,
    pub local: LocalTierConfig,
    pub durable: DbConfig,
}

impl QuarryConfig {
    pub fn from_env() -> Self {
        Self {
            cache: CachePolicy::from_env(),
            refresh: RefreshPolicy::from_env(),
            local: LocalTierConfig::from_env(),
            durable: DbConfig::from_env(),
        }
    }

    /// Parse and validate a TOML document. Missing sections and fields take
    /// their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validates:
    /// - every TTL and refresh interval is positive
    /// - quality_warning_threshold in [0, 100]
    /// - local.max_size_mb and durable.max_size are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.refresh.validate()?;

        if self.local.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "local.max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "max_size_mb must be greater than 0".to_string(),
            });
        }
        if self.durable.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "durable.max_size".to_string(),
                value: "0".to_string(),
                reason: "max_size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = QuarryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.quality_warning_threshold, 60.0);
        assert_eq!(config.cache.local_ttl, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_refresh_intervals_by_granularity() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.refresh_interval(DataType::Daily), Duration::from_secs(7 * DAY));
        assert_eq!(policy.refresh_interval(DataType::Weekly), Duration::from_secs(30 * DAY));
        assert_eq!(
            policy.refresh_interval(DataType::Fundamentals),
            Duration::from_secs(60 * DAY)
        );
    }

    #[test]
    fn test_delta_interval_shorter_than_full() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.delta_interval(DataType::Daily), Duration::from_secs(DAY));
        assert_eq!(policy.delta_interval(DataType::Weekly), Duration::from_secs(7 * DAY));
        assert_eq!(policy.delta_interval(DataType::Monthly), Duration::from_secs(30 * DAY));
        for dt in DataType::ALL {
            assert!(policy.delta_interval(dt) < policy.refresh_interval(dt));
        }

        // A full-refresh override below the delta cadence caps it.
        let tight = policy.with_override(DataType::News, Duration::from_secs(HOUR));
        assert_eq!(tight.delta_interval(DataType::News), Duration::from_secs(HOUR));
    }

    #[test]
    fn test_refresh_override_wins() {
        let policy = RefreshPolicy::default().with_override(DataType::News, Duration::from_secs(HOUR));
        assert_eq!(policy.refresh_interval(DataType::News), Duration::from_secs(HOUR));
        assert_eq!(policy.refresh_interval(DataType::Daily), Duration::from_secs(7 * DAY));
    }

    #[test]
    fn test_from_toml_partial() {
        let raw = r#"
            [cache]
            local_ttl = 3600
            quality_warning_threshold = 75.0

            [refresh]
            fine = 86400

            [refresh.overrides]
            news = 7200

            [local]
            path = "/tmp/quarry"
        "#;
        let config = QuarryConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.cache.local_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.durable_ttl, CachePolicy::default().durable_ttl);
        assert_eq!(config.cache.quality_warning_threshold, 75.0);
        assert_eq!(config.refresh.refresh_interval(DataType::Daily), Duration::from_secs(DAY));
        assert_eq!(config.refresh.refresh_interval(DataType::News), Duration::from_secs(7200));
        assert_eq!(config.local.path, PathBuf::from("/tmp/quarry"));
        assert_eq!(config.durable, DbConfig::default());
    }

    #[test]
    fn test_from_toml_rejects_zero_ttl() {
        let err = QuarryConfig::from_toml_str("[cache]\nlocal_ttl = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "cache.local_ttl"));
    }

    #[test]
    fn test_threshold_out_of_range() {
        let mut config = QuarryConfig::default();
        config.cache.quality_warning_threshold = 150.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_parse_error() {
        let err = QuarryConfig::from_toml_str("[cache\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_ttl_for_data_type() {
        let policy = CachePolicy::default();
        assert_eq!(policy.ttl_for(DataType::Daily), policy.bars_ttl);
        assert_eq!(policy.ttl_for(DataType::News), policy.news_ttl);
        assert_eq!(policy.ttl_for(DataType::Intraday), policy.intraday_ttl);
    }

    #[test]
    fn test_from_file_missing() {
        let err = QuarryConfig::from_file("/nonexistent/quarry.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
