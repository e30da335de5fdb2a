//! Domain Services
//!
//! Each service owns the cache-key layout and TTL choice for one kind of
//! market data and hands the orchestrator a refresh closure that calls the
//! provider. Services never see tier errors; reads come back as a
//! [`CacheResponse`](quarry_storage::CacheResponse).

mod economic;
mod fundamentals;
mod news;
mod stock;

pub use economic::EconomicDataService;
pub use fundamentals::FundamentalsService;
pub use news::NewsService;
pub use stock::StockDataService;

use chrono::NaiveDate;
use quarry_core::CacheKey;

/// Attach an optional date bound to a key.
pub(crate) fn with_date_param(key: CacheKey, name: &str, date: Option<NaiveDate>) -> CacheKey {
    match date {
        Some(date) => key.with_param(name, date),
        None => key,
    }
}
