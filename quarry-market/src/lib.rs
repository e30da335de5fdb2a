//! QUARRY Market - Market-data services
//!
//! Stock bars, fundamentals, economic series and news, each served through
//! the tiered cache in `quarry-storage` and refreshed from a
//! [`MarketDataProvider`]. [`MarketDataPlatform`] wires it all together.

pub mod platform;
pub mod provider;
pub mod services;
pub mod telemetry;

pub use platform::{InMemoryPlatform, MarketDataPlatform, ProductionPlatform};
pub use provider::{MarketDataProvider, ProviderError, ProviderResult, SharedProvider};
pub use services::{EconomicDataService, FundamentalsService, NewsService, StockDataService};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
