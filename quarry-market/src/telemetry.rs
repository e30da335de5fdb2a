//! Tracing Subscriber Initialization
//!
//! Installs a `tracing-subscriber` registry with an env filter and fmt
//! output. The filter comes from `QUARRY_LOG`, then `RUST_LOG`, then the
//! configured default.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    Json,
    /// Multi-line human-readable output.
    Pretty,
}

/// Logging configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Filter directives used when neither `QUARRY_LOG` nor `RUST_LOG` is set
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("QUARRY_SERVICE_NAME")
                .unwrap_or_else(|_| "quarry".to_string()),
            default_filter: "quarry_storage=info,quarry_market=info,warn".to_string(),
            format: match std::env::var("QUARRY_LOG_FORMAT").as_deref() {
                Ok("pretty") => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directives}': {reason}")]
    Filter { directives: String, reason: String },

    #[error("Failed to init subscriber: {0}")]
    Init(String),
}

/// Resolve the env filter: `QUARRY_LOG`, then `RUST_LOG`, then the default.
pub fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    let directives = std::env::var("QUARRY_LOG")
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|_| config.default_filter.clone());

    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter {
        directives,
        reason: e.to_string(),
    })
}

/// Install the global subscriber. Call once at startup; a second call
/// fails with [`TelemetryError::Init`].
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::info!(
        service_name = config.service_name,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_filter_precedence_and_errors() {
        let _rust_log = EnvVarGuard::set("RUST_LOG", Some("debug"));
        let _quarry = EnvVarGuard::set("QUARRY_LOG", Some("quarry_storage=trace"));
        let config = TelemetryConfig::default();
        let filter = build_filter(&config).unwrap();
        assert!(filter.to_string().contains("quarry_storage=trace"));

        let _quarry = EnvVarGuard::set("QUARRY_LOG", Some("quarry_storage=notalevel"));
        assert!(matches!(
            build_filter(&config),
            Err(TelemetryError::Filter { .. })
        ));
    }

    #[test]
    fn test_default_config() {
        let _format = EnvVarGuard::set("QUARRY_LOG_FORMAT", Some("pretty"));
        let config = TelemetryConfig::default();
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.default_filter.contains("quarry_storage"));
    }
}
