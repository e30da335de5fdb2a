//! Enum types shared across the workspace

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ConfigError;

/// Which layer answered a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Fast embedded key/value store
    Local,
    /// Durable document store
    Durable,
    /// The external provider, via the caller's refresh closure
    Source,
}

/// Health of a cache read, so callers can tell "healthy but empty" from
/// "degraded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    /// Served within TTL, or freshly fetched
    Fresh,
    /// Served past its TTL because the refresh failed
    Stale,
    /// Nothing cached and the refresh failed
    Unavailable,
}

/// How coarse a data type's update cadence is. Drives the default
/// refresh interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Fine,
    Medium,
    Coarse,
}

/// Data granularity tracked by coverage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Intraday,
    Daily,
    Weekly,
    Monthly,
    Fundamentals,
    Economic,
    News,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::Intraday,
        DataType::Daily,
        DataType::Weekly,
        DataType::Monthly,
        DataType::Fundamentals,
        DataType::Economic,
        DataType::News,
    ];

    pub fn granularity(&self) -> Granularity {
        match self {
            DataType::Intraday | DataType::Daily | DataType::News => Granularity::Fine,
            DataType::Weekly | DataType::Economic => Granularity::Medium,
            DataType::Monthly | DataType::Fundamentals => Granularity::Coarse,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Intraday => "intraday",
            DataType::Daily => "daily",
            DataType::Weekly => "weekly",
            DataType::Monthly => "monthly",
            DataType::Fundamentals => "fundamentals",
            DataType::Economic => "economic",
            DataType::News => "news",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "data_type".to_string(),
                value: s.to_string(),
                reason: "unknown data type".to_string(),
            })
    }
}

/// Whether a refresh replaced the full history or appended a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Full,
    Delta,
}

/// Discriminator for the tagged record variants. Also names the durable
/// collection a record lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Bar,
    Fundamental,
    Economic,
    News,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Bar => "bar",
            RecordKind::Fundamental => "fundamental",
            RecordKind::Economic => "economic",
            RecordKind::News => "news",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bar" => Ok(RecordKind::Bar),
            "fundamental" => Ok(RecordKind::Fundamental),
            "economic" => Ok(RecordKind::Economic),
            "news" => Ok(RecordKind::News),
            other => Err(ConfigError::InvalidValue {
                field: "record_kind".to_string(),
                value: other.to_string(),
                reason: "unknown record kind".to_string(),
            }),
        }
    }
}
