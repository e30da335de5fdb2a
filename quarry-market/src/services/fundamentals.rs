//! Company fundamentals.

use std::sync::Arc;

use quarry_core::{CacheKey, DataType};
use quarry_storage::{CacheOrchestrator, CacheResponse, DurableTier, LocalTier, RefreshResult};

use crate::provider::{into_records, SharedProvider};

/// Reporting-period fundamentals, cached per symbol.
pub struct FundamentalsService<L: LocalTier, D: DurableTier> {
    orchestrator: Arc<CacheOrchestrator<L, D>>,
    provider: SharedProvider,
}

impl<L: LocalTier, D: DurableTier> FundamentalsService<L, D> {
    pub fn new(orchestrator: Arc<CacheOrchestrator<L, D>>, provider: SharedProvider) -> Self {
        Self {
            orchestrator,
            provider,
        }
    }

    pub fn key(symbol: &str) -> CacheKey {
        CacheKey::new(symbol, DataType::Fundamentals.as_str())
    }

    pub async fn fundamentals(&self, symbol: &str) -> CacheResponse {
        let ttl = self.orchestrator.policy().ttl_for(DataType::Fundamentals);
        let provider = self.provider.clone();
        let owned_symbol = symbol.to_string();

        self.orchestrator
            .get(&Self::key(symbol), ttl, move || async move {
                let rows = provider.fetch_fundamentals(&owned_symbol).await?;
                RefreshResult::Ok(into_records(rows))
            })
            .await
    }

    pub async fn invalidate(&self, symbol: &str) -> bool {
        self.orchestrator.clear(&Self::key(symbol)).await
    }
}
