//! Macroeconomic series.

use std::sync::Arc;

use chrono::NaiveDate;
use quarry_core::{CacheKey, DataType, RecordKind};
use quarry_storage::{
    CacheOrchestrator, CacheResponse, DurableScope, DurableTier, LocalTier, RefreshResult,
};

use super::with_date_param;
use crate::provider::{into_records, SharedProvider};

/// Observations of one economic series, cached per date range. The durable
/// step matches on the range, so overlapping ranges share stored rows.
pub struct EconomicDataService<L: LocalTier, D: DurableTier> {
    orchestrator: Arc<CacheOrchestrator<L, D>>,
    provider: SharedProvider,
}

impl<L: LocalTier, D: DurableTier> EconomicDataService<L, D> {
    pub fn new(orchestrator: Arc<CacheOrchestrator<L, D>>, provider: SharedProvider) -> Self {
        Self {
            orchestrator,
            provider,
        }
    }

    pub fn key(series_id: &str, start: Option<NaiveDate>, end: Option<NaiveDate>) -> CacheKey {
        let key = CacheKey::new(series_id, DataType::Economic.as_str());
        with_date_param(with_date_param(key, "start", start), "end", end)
    }

    pub async fn series(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> CacheResponse {
        let key = Self::key(series_id, start, end);
        let scope = DurableScope::new(series_id, RecordKind::Economic, DataType::Economic.as_str())
            .between(start, end);
        let ttl = self.orchestrator.policy().ttl_for(DataType::Economic);
        let provider = self.provider.clone();
        let owned_id = series_id.to_string();

        self.orchestrator
            .get_scoped(&key, ttl, &scope, move || async move {
                let rows = provider
                    .fetch_economic_series(&owned_id, start, end)
                    .await?;
                RefreshResult::Ok(into_records(rows))
            })
            .await
    }

    pub async fn invalidate(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> bool {
        self.orchestrator
            .clear(&Self::key(series_id, start, end))
            .await
    }
}
