//! News headlines.

use std::sync::Arc;

use quarry_core::{CacheKey, DataType};
use quarry_storage::{CacheOrchestrator, CacheResponse, DurableTier, LocalTier, RefreshResult};

use crate::provider::{into_records, SharedProvider};

/// Entity used for market-wide headlines.
pub const MARKET_WIDE: &str = "market";

/// Latest headlines per symbol (or market-wide), on a short TTL.
pub struct NewsService<L: LocalTier, D: DurableTier> {
    orchestrator: Arc<CacheOrchestrator<L, D>>,
    provider: SharedProvider,
}

impl<L: LocalTier, D: DurableTier> NewsService<L, D> {
    pub fn new(orchestrator: Arc<CacheOrchestrator<L, D>>, provider: SharedProvider) -> Self {
        Self {
            orchestrator,
            provider,
        }
    }

    pub fn key(symbol: Option<&str>, limit: usize) -> CacheKey {
        CacheKey::new(symbol.unwrap_or(MARKET_WIDE), DataType::News.as_str())
            .with_param("limit", limit)
    }

    pub async fn latest(&self, symbol: Option<&str>, limit: usize) -> CacheResponse {
        let ttl = self.orchestrator.policy().ttl_for(DataType::News);
        let provider = self.provider.clone();
        let owned_symbol = symbol.map(str::to_string);

        self.orchestrator
            .get(&Self::key(symbol, limit), ttl, move || async move {
                let articles = provider
                    .fetch_news(owned_symbol.as_deref(), limit)
                    .await?;
                RefreshResult::Ok(into_records(articles))
            })
            .await
    }
}
