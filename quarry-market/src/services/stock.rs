//! Stock price bars.
//!
//! Daily bars are coverage-driven: the tracker decides between a full
//! history refetch, a delta since the last stored date, or no provider call
//! at all (served from the durable tier). Other granularities go straight
//! through the orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use quarry_core::{
    CacheKey, CoverageRecord, DataType, MarketRecord, RecordKind, RefreshError, RefreshPlan, Tier,
    UpdateType,
};
use quarry_storage::{
    CacheOrchestrator, CacheResponse, CoverageStore, CoverageTracker, DurableScope, DurableTier,
    Freshness, LocalTier, RefreshResult,
};
use tracing::{debug, info, warn};

use super::with_date_param;
use crate::provider::{into_records, SharedProvider};

/// Bars for one symbol, filtered to `[start, end]`.
fn fetch_bars(
    provider: SharedProvider,
    symbol: String,
    data_type: DataType,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> impl std::future::Future<Output = RefreshResult> + Send + 'static {
    async move {
        let bars = provider.fetch_bars(&symbol, data_type, start, end).await?;
        Ok(into_records(bars))
    }
}

/// Bars since `since`, merged over the history stored under `key`.
async fn fetch_delta<D: DurableTier>(
    provider: SharedProvider,
    durable: Arc<D>,
    symbol: String,
    since: NaiveDate,
    key: CacheKey,
) -> RefreshResult {
    let fresh = provider
        .fetch_bars(&symbol, DataType::Daily, Some(since), None)
        .await?;
    let history = durable
        .get(&key, Freshness::IgnoreTtl)
        .await
        .map_err(|e| RefreshError::provider(format!("stored history unavailable: {}", e)))?
        .map(|batch| batch.records)
        .unwrap_or_default();
    Ok(merge_by_as_of(history, into_records(fresh)))
}

/// Fresh rows win over stored rows with the same `as_of`.
fn merge_by_as_of(history: Vec<MarketRecord>, fresh: Vec<MarketRecord>) -> Vec<MarketRecord> {
    let mut merged = BTreeMap::new();
    for record in history.into_iter().chain(fresh) {
        merged.insert(record.as_of(), record);
    }
    merged.into_values().collect()
}

/// Price-bar service.
pub struct StockDataService<L, D, S>
where
    L: LocalTier,
    D: DurableTier,
    S: CoverageStore,
{
    orchestrator: Arc<CacheOrchestrator<L, D>>,
    coverage: Arc<CoverageTracker<S>>,
    provider: SharedProvider,
}

impl<L, D, S> StockDataService<L, D, S>
where
    L: LocalTier,
    D: DurableTier,
    S: CoverageStore,
{
    pub fn new(
        orchestrator: Arc<CacheOrchestrator<L, D>>,
        coverage: Arc<CoverageTracker<S>>,
        provider: SharedProvider,
    ) -> Self {
        Self {
            orchestrator,
            coverage,
            provider,
        }
    }

    pub fn daily_key(symbol: &str) -> CacheKey {
        CacheKey::new(symbol, DataType::Daily.as_str())
    }

    fn daily_scope(symbol: &str) -> DurableScope {
        DurableScope::new(symbol, RecordKind::Bar, DataType::Daily.as_str())
    }

    /// Full daily history for `symbol`.
    pub async fn daily_bars(&self, symbol: &str) -> CacheResponse {
        let record = match self.coverage.get_or_create(symbol, DataType::Daily).await {
            Ok(record) => record,
            Err(e) => {
                warn!(symbol, error = %e, "coverage unavailable, using plain cache read");
                return self.refresh_full(symbol).await;
            }
        };

        let plan = self.coverage.plan_refresh(&record);
        debug!(symbol, plan = ?plan, "daily bars plan");

        match plan {
            RefreshPlan::Skip => {
                let stored = self
                    .orchestrator
                    .read_durable(&Self::daily_scope(symbol))
                    .await;
                if !record.is_active || !stored.is_empty() {
                    return stored;
                }
                info!(symbol, "durable tier empty despite coverage, refetching");
                let response = self.refresh_full(symbol).await;
                self.record_coverage(&record, &response, UpdateType::Full)
                    .await;
                response
            }
            RefreshPlan::Full => {
                let response = self.refresh_full(symbol).await;
                self.record_coverage(&record, &response, UpdateType::Full)
                    .await;
                response
            }
            RefreshPlan::Delta { since } => {
                let response = self.refresh_delta(symbol, since).await;
                self.record_coverage(&record, &response, UpdateType::Delta)
                    .await;
                response
            }
        }
    }

    /// Daily bars restricted to `[start, end]`.
    pub async fn daily_bars_between(
        &self,
        symbol: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> CacheResponse {
        let mut response = self.daily_bars(symbol).await;
        let scope = Self::daily_scope(symbol).between(start, end);
        response
            .records
            .retain(|record| scope.contains(record.as_of_date()));
        response
    }

    /// Bars at any granularity without coverage bookkeeping.
    pub async fn bars(
        &self,
        symbol: &str,
        data_type: DataType,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> CacheResponse {
        let key = with_date_param(
            with_date_param(CacheKey::new(symbol, data_type.as_str()), "start", start),
            "end",
            end,
        );
        let scope =
            DurableScope::new(symbol, RecordKind::Bar, data_type.as_str()).between(start, end);
        let ttl = self.orchestrator.policy().ttl_for(data_type);

        let refresh = fetch_bars(
            self.provider.clone(),
            symbol.to_string(),
            data_type,
            start,
            end,
        );
        self.orchestrator
            .get_scoped(&key, ttl, &scope, move || refresh)
            .await
    }

    /// Drop cached daily bars for `symbol` from both tiers.
    pub async fn invalidate(&self, symbol: &str) -> bool {
        self.orchestrator.clear(&Self::daily_key(symbol)).await
    }

    async fn refresh_full(&self, symbol: &str) -> CacheResponse {
        let key = Self::daily_key(symbol);
        let scope = Self::daily_scope(symbol);
        let ttl = self.orchestrator.policy().ttl_for(DataType::Daily);
        let refresh = fetch_bars(
            self.provider.clone(),
            symbol.to_string(),
            DataType::Daily,
            None,
            None,
        );
        self.orchestrator
            .get_scoped(&key, ttl, &scope, move || refresh)
            .await
    }

    /// Fetch bars from `since` on and merge them into the stored history,
    /// so the local tier keeps holding the whole series.
    async fn refresh_delta(&self, symbol: &str, since: NaiveDate) -> CacheResponse {
        let key = Self::daily_key(symbol);
        let scope = Self::daily_scope(symbol);
        let ttl = self.orchestrator.policy().ttl_for(DataType::Daily);

        let refresh = fetch_delta(
            self.provider.clone(),
            self.orchestrator.durable().clone(),
            symbol.to_string(),
            since,
            key.clone(),
        );

        self.orchestrator
            .get_scoped(&key, ttl, &scope, move || refresh)
            .await
    }

    /// Fold a provider refresh into coverage. A delta response already
    /// holds the merged series, so both kinds describe the whole stored
    /// history. Cache hits and failed refreshes leave coverage untouched.
    async fn record_coverage(
        &self,
        record: &CoverageRecord,
        response: &CacheResponse,
        update_type: UpdateType,
    ) {
        if response.tier != Some(Tier::Source) {
            return;
        }
        if let Err(e) = self
            .coverage
            .update(record, &response.records, update_type)
            .await
        {
            warn!(
                symbol = %record.entity_id,
                update_type = ?update_type,
                error = %e,
                "coverage update failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use quarry_core::PriceBar;

    fn bar(day: u32, close: f64) -> MarketRecord {
        MarketRecord::from(PriceBar {
            symbol: "AAPL".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, day, 21, 0, 0).unwrap(),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            volume: Some(1),
            adjusted_close: None,
        })
    }

    #[test]
    fn test_merge_prefers_fresh_rows() {
        let merged = merge_by_as_of(
            vec![bar(1, 10.0), bar(2, 11.0)],
            vec![bar(2, 12.0), bar(3, 13.0)],
        );
        assert_eq!(merged, vec![bar(1, 10.0), bar(2, 12.0), bar(3, 13.0)]);
    }

    #[test]
    fn test_daily_key_layout() {
        type Svc = StockDataService<
            quarry_storage::MemoryLocalTier,
            quarry_storage::MemoryDocumentStore,
            quarry_storage::MemoryCoverageStore,
        >;
        assert_eq!(Svc::daily_key("AAPL").render(), "AAPL:daily");
    }
}
