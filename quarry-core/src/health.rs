//! Tier health reporting

use serde::{Deserialize, Serialize};

use crate::Tier;

/// Health status for a tier or the platform as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Reachable, but something is off (e.g. slow ping).
    Degraded,
    Unhealthy,
}

/// Result of pinging one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub component: String,
    pub tier: Option<Tier>,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub response_time_ms: Option<i64>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            tier: None,
            status: HealthStatus::Healthy,
            message: None,
            response_time_ms: None,
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            tier: None,
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            response_time_ms: None,
        }
    }

    pub fn for_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Worst status across checks. One unhealthy tier degrades the platform;
/// all unhealthy makes it unhealthy.
pub fn overall_status(checks: &[HealthCheck]) -> HealthStatus {
    if checks.is_empty() {
        return HealthStatus::Healthy;
    }
    let unhealthy = checks
        .iter()
        .filter(|c| c.status == HealthStatus::Unhealthy)
        .count();
    if unhealthy == checks.len() {
        HealthStatus::Unhealthy
    } else if unhealthy > 0 || checks.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        let local = HealthCheck::healthy("lmdb").for_tier(Tier::Local);
        let durable = HealthCheck::unhealthy("postgres", "connection refused").for_tier(Tier::Durable);

        assert_eq!(overall_status(&[local.clone()]), HealthStatus::Healthy);
        assert_eq!(
            overall_status(&[local, durable.clone()]),
            HealthStatus::Degraded
        );
        assert_eq!(overall_status(&[durable]), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_serialization() {
        let check = HealthCheck::healthy("lmdb")
            .for_tier(Tier::Local)
            .with_response_time(2);
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["tier"], "local");
        assert_eq!(json["response_time_ms"], 2);
    }
}
