//! Upstream market-data provider seam.
//!
//! Response parsing lives in the provider implementations; services only see
//! typed records or a [`ProviderError`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use quarry_core::{
    DataType, EconomicObservation, FundamentalRecord, MarketRecord, NewsArticle, PriceBar,
    RefreshError,
};
use thiserror::Error;

/// Failures reported by a provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{provider} unreachable: {reason}")]
    Unreachable { provider: String, reason: String },

    #[error("{provider} rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    #[error("{provider} has no data for {entity}")]
    NotFound { provider: String, entity: String },

    #[error("{provider} returned a malformed response: {reason}")]
    Malformed { provider: String, reason: String },
}

impl From<ProviderError> for RefreshError {
    fn from(err: ProviderError) -> Self {
        RefreshError::provider(err.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Source of truth for market data.
#[async_trait]
pub trait MarketDataProvider: Send + Sync + 'static {
    /// Short name, recorded as the coverage `source`.
    fn name(&self) -> &str;

    /// Price bars for `symbol` at the granularity of `data_type`, limited to
    /// `[start, end]` when given.
    async fn fetch_bars(
        &self,
        symbol: &str,
        data_type: DataType,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> ProviderResult<Vec<PriceBar>>;

    async fn fetch_fundamentals(&self, symbol: &str) -> ProviderResult<Vec<FundamentalRecord>>;

    async fn fetch_economic_series(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> ProviderResult<Vec<EconomicObservation>>;

    /// Most recent articles, newest first. `symbol = None` means market-wide.
    async fn fetch_news(&self, symbol: Option<&str>, limit: usize)
        -> ProviderResult<Vec<NewsArticle>>;
}

pub type SharedProvider = Arc<dyn MarketDataProvider>;

/// Convert provider output into cacheable records.
pub(crate) fn into_records<T: Into<MarketRecord>>(items: Vec<T>) -> Vec<MarketRecord> {
    items.into_iter().map(Into::into).collect()
}
