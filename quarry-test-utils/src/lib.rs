//! QUARRY Test Utilities
//!
//! Centralized test infrastructure for the QUARRY workspace:
//! - Proptest generators for market records and cache keys
//! - A scripted market-data provider
//! - Tier doubles that always fail
//! - Test fixtures for common scenarios

// Re-export core types for convenience
pub use quarry_core::{
    CacheKey, CachePolicy, DataType, EconomicObservation, FundamentalRecord, MarketRecord,
    MockClock, NewsArticle, PriceBar, QuarryConfig, QuarryResult, RefreshPolicy, SharedClock,
    Timestamp,
};
pub use quarry_market::{MarketDataProvider, ProviderError, ProviderResult, SharedProvider};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use quarry_core::{QualityScore, Tier, TierError};
use quarry_storage::{
    CacheStats, CachedBatch, DurableScope, DurableTier, Freshness, LocalTier,
};

// ============================================================================
// SCRIPTED PROVIDER
// ============================================================================

/// One call received by [`ScriptedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub method: &'static str,
    pub entity: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// Provider that serves canned data and records every call.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    bars: Mutex<HashMap<String, Vec<PriceBar>>>,
    fundamentals: Mutex<HashMap<String, Vec<FundamentalRecord>>>,
    economic: Mutex<HashMap<String, Vec<EconomicObservation>>>,
    news: Mutex<Vec<NewsArticle>>,
    failure: Mutex<Option<ProviderError>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<ProviderCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(self, symbol: &str, bars: Vec<PriceBar>) -> Self {
        self.set_bars(symbol, bars);
        self
    }

    pub fn with_fundamentals(self, symbol: &str, rows: Vec<FundamentalRecord>) -> Self {
        self.fundamentals
            .lock()
            .unwrap()
            .insert(symbol.to_string(), rows);
        self
    }

    pub fn with_economic(self, series_id: &str, rows: Vec<EconomicObservation>) -> Self {
        self.economic
            .lock()
            .unwrap()
            .insert(series_id.to_string(), rows);
        self
    }

    pub fn with_news(self, articles: Vec<NewsArticle>) -> Self {
        *self.news.lock().unwrap() = articles;
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Replace the bars served for `symbol`.
    pub fn set_bars(&self, symbol: &str, bars: Vec<PriceBar>) {
        self.bars.lock().unwrap().insert(symbol.to_string(), bars);
    }

    /// Append bars for `symbol`, as if new trading days had closed.
    pub fn push_bars(&self, symbol: &str, more: Vec<PriceBar>) {
        self.bars
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .extend(more);
    }

    /// Fail every call with `err` until [`recover`](Self::recover).
    pub fn fail_with(&self, err: ProviderError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn last_call(&self) -> Option<ProviderCall> {
        self.calls.lock().unwrap().last().cloned()
    }

    async fn begin(
        &self,
        method: &'static str,
        entity: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> ProviderResult<()> {
        self.calls.lock().unwrap().push(ProviderCall {
            method,
            entity: entity.to_string(),
            start,
            end,
        });
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(entity: &str) -> ProviderError {
        ProviderError::NotFound {
            provider: "scripted".to_string(),
            entity: entity.to_string(),
        }
    }
}

fn in_range(date: NaiveDate, start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
    start.map_or(true, |s| date >= s) && end.map_or(true, |e| date <= e)
}

#[async_trait]
impl MarketDataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        _data_type: DataType,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> ProviderResult<Vec<PriceBar>> {
        self.begin("fetch_bars", symbol, start, end).await?;
        let bars = self.bars.lock().unwrap();
        let series = bars.get(symbol).ok_or_else(|| Self::not_found(symbol))?;
        Ok(series
            .iter()
            .filter(|b| in_range(b.timestamp.date_naive(), start, end))
            .cloned()
            .collect())
    }

    async fn fetch_fundamentals(&self, symbol: &str) -> ProviderResult<Vec<FundamentalRecord>> {
        self.begin("fetch_fundamentals", symbol, None, None).await?;
        self.fundamentals
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| Self::not_found(symbol))
    }

    async fn fetch_economic_series(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> ProviderResult<Vec<EconomicObservation>> {
        self.begin("fetch_economic_series", series_id, start, end)
            .await?;
        let economic = self.economic.lock().unwrap();
        let series = economic
            .get(series_id)
            .ok_or_else(|| Self::not_found(series_id))?;
        Ok(series
            .iter()
            .filter(|o| in_range(o.date, start, end))
            .cloned()
            .collect())
    }

    async fn fetch_news(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> ProviderResult<Vec<NewsArticle>> {
        self.begin("fetch_news", symbol.unwrap_or("market"), None, None)
            .await?;
        let mut articles: Vec<_> = self
            .news
            .lock()
            .unwrap()
            .iter()
            .filter(|a| symbol.map_or(true, |s| a.symbol.as_deref() == Some(s)))
            .cloned()
            .collect();
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        articles.truncate(limit);
        Ok(articles)
    }
}

// ============================================================================
// FAILING TIERS
// ============================================================================

/// Local tier whose every operation fails as unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingLocalTier;

fn down<T>(tier: Tier) -> QuarryResult<T> {
    Err(TierError::unavailable(tier, "tier is down").into())
}

#[async_trait]
impl LocalTier for FailingLocalTier {
    async fn get(&self, _key: &CacheKey, _freshness: Freshness) -> QuarryResult<Option<CachedBatch>> {
        down(Tier::Local)
    }

    async fn put(
        &self,
        _key: &CacheKey,
        _records: &[MarketRecord],
        _quality: Option<&QualityScore>,
    ) -> QuarryResult<Timestamp> {
        down(Tier::Local)
    }

    async fn delete(&self, _key: &CacheKey) -> QuarryResult<bool> {
        down(Tier::Local)
    }

    async fn stats(&self) -> QuarryResult<CacheStats> {
        down(Tier::Local)
    }

    async fn ping(&self) -> QuarryResult<()> {
        down(Tier::Local)
    }

    fn name(&self) -> &'static str {
        "failing-local"
    }
}

/// Durable tier whose every operation fails as unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingDurableTier;

#[async_trait]
impl DurableTier for FailingDurableTier {
    async fn get(&self, _key: &CacheKey, _freshness: Freshness) -> QuarryResult<Option<CachedBatch>> {
        down(Tier::Durable)
    }

    async fn query(
        &self,
        _scope: &DurableScope,
        _freshness: Freshness,
    ) -> QuarryResult<Option<CachedBatch>> {
        down(Tier::Durable)
    }

    async fn put(
        &self,
        _key: &CacheKey,
        _records: &[MarketRecord],
        _extent: Option<&DurableScope>,
    ) -> QuarryResult<u64> {
        down(Tier::Durable)
    }

    async fn delete(&self, _key: &CacheKey) -> QuarryResult<u64> {
        down(Tier::Durable)
    }

    async fn ping(&self) -> QuarryResult<()> {
        down(Tier::Durable)
    }

    fn name(&self) -> &'static str {
        "failing-durable"
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::{Days, TimeZone, Utc};
    use proptest::prelude::*;

    fn base_day() -> Timestamp {
        Utc.with_ymd_and_hms(2020, 1, 1, 21, 0, 0).unwrap()
    }

    /// Generate a DataType variant.
    pub fn arb_data_type() -> impl Strategy<Value = DataType> {
        prop_oneof![
            Just(DataType::Intraday),
            Just(DataType::Daily),
            Just(DataType::Weekly),
            Just(DataType::Monthly),
            Just(DataType::Fundamentals),
            Just(DataType::Economic),
            Just(DataType::News),
        ]
    }

    /// Generate a ticker-like symbol.
    pub fn arb_symbol() -> impl Strategy<Value = String> {
        "[A-Z]{1,5}"
    }

    /// Generate a cache key with up to three params, some of them awkward.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (
            arb_symbol(),
            arb_data_type(),
            prop::collection::btree_map("[a-z]{1,8}", "[A-Za-z0-9._-]{1,12}", 0..3),
        )
            .prop_map(|(symbol, data_type, params)| {
                params
                    .into_iter()
                    .fold(CacheKey::new(symbol, data_type.as_str()), |key, (k, v)| {
                        key.with_param(k, v)
                    })
            })
    }

    /// Generate an internally consistent bar on `day_offset` days after
    /// 2020-01-01.
    pub fn arb_price_bar_on(symbol: String, day_offset: u64) -> impl Strategy<Value = PriceBar> {
        (0.5f64..1_000.0, 0.0f64..100.0, 0.0f64..=1.0, 0.0f64..=1.0, 0i64..50_000_000).prop_map(
            move |(low, spread, open_at, close_at, volume)| PriceBar {
                symbol: symbol.clone(),
                timestamp: base_day() + Days::new(day_offset),
                open: Some(low + spread * open_at),
                high: Some(low + spread),
                low: Some(low),
                close: Some(low + spread * close_at),
                volume: Some(volume),
                adjusted_close: None,
            },
        )
    }

    /// Generate a consistent bar for `symbol` on some day.
    pub fn arb_price_bar(symbol: String) -> impl Strategy<Value = PriceBar> {
        (0u64..2_000).prop_flat_map(move |day| arb_price_bar_on(symbol.clone(), day))
    }

    /// Generate 1..=`max` bars for `symbol` on distinct days, date-ordered.
    pub fn arb_bars(symbol: String, max: usize) -> impl Strategy<Value = Vec<PriceBar>> {
        prop::collection::btree_set(0u64..2_000, 1..=max.max(1)).prop_flat_map(move |days| {
            days.into_iter()
                .map(|day| arb_price_bar_on(symbol.clone(), day))
                .collect::<Vec<_>>()
        })
    }

    /// Generate a bar with any subset of its numeric fields missing or
    /// out of domain.
    pub fn arb_messy_price_bar() -> impl Strategy<Value = PriceBar> {
        let field = prop_oneof![
            Just(None),
            (-100.0f64..1_000.0).prop_map(Some),
            Just(Some(f64::NAN)),
        ];
        (
            arb_symbol(),
            field.clone(),
            field.clone(),
            field.clone(),
            field,
            prop::option::of(-1_000i64..1_000_000),
        )
            .prop_map(|(symbol, open, high, low, close, volume)| PriceBar {
                symbol,
                timestamp: base_day(),
                open,
                high,
                low,
                close,
                volume,
                adjusted_close: None,
            })
    }

    /// Generate a fundamentals row.
    pub fn arb_fundamental() -> impl Strategy<Value = FundamentalRecord> {
        (
            arb_symbol(),
            0u64..40,
            prop::option::of(1.0e6f64..1.0e11),
            prop::option::of(-0.5f64..0.5),
            prop::option::of(-10.0f64..50.0),
            prop::option::of(1_000_000i64..20_000_000_000),
        )
            .prop_map(|(symbol, quarter, revenue, margin, eps, shares)| {
                FundamentalRecord {
                    symbol,
                    period_end: base_day().date_naive() + Days::new(quarter * 91),
                    revenue,
                    net_income: revenue.zip(margin).map(|(r, m)| r * m),
                    eps,
                    shares_outstanding: shares,
                    profit_margin: margin,
                }
            })
    }

    /// Generate an economic observation.
    pub fn arb_economic() -> impl Strategy<Value = EconomicObservation> {
        ("[A-Z]{3,8}", 0u64..3_000, prop::option::of(-100.0f64..30_000.0)).prop_map(
            |(series_id, day, value)| EconomicObservation {
                series_id,
                date: base_day().date_naive() + Days::new(day),
                value,
                unit: Some("index".to_string()),
            },
        )
    }

    /// Generate a news article.
    pub fn arb_news() -> impl Strategy<Value = NewsArticle> {
        (
            "[a-f0-9]{12}",
            prop::option::of(arb_symbol()),
            0u64..2_000,
            prop::option::of("[A-Za-z ]{5,60}"),
            prop::option::of(-1.0f64..=1.0),
        )
            .prop_map(|(article_id, symbol, day, headline, sentiment)| NewsArticle {
                article_id,
                symbol,
                published_at: base_day() + Days::new(day),
                headline,
                source: Some("wire".to_string()),
                url: None,
                sentiment,
            })
    }

    /// Generate any market record.
    pub fn arb_market_record() -> impl Strategy<Value = MarketRecord> {
        prop_oneof![
            arb_symbol()
                .prop_flat_map(arb_price_bar)
                .prop_map(MarketRecord::from),
            arb_messy_price_bar().prop_map(MarketRecord::from),
            arb_fundamental().prop_map(MarketRecord::from),
            arb_economic().prop_map(MarketRecord::from),
            arb_news().prop_map(MarketRecord::from),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use chrono::{Days, TimeZone, Utc};

    fn close_on(date: NaiveDate) -> Timestamp {
        Utc.from_utc_datetime(&date.and_hms_opt(21, 0, 0).unwrap_or_default())
    }

    fn bar_on(symbol: &str, date: NaiveDate, i: usize) -> PriceBar {
        let base = 100.0 + i as f64;
        PriceBar {
            symbol: symbol.to_string(),
            timestamp: close_on(date),
            open: Some(base),
            high: Some(base + 2.0),
            low: Some(base - 1.0),
            close: Some(base + 1.0),
            volume: Some(1_000_000 + i as i64),
            adjusted_close: None,
        }
    }

    /// `n` valid daily bars on consecutive days from 2023-01-01.
    pub fn sample_bars(symbol: &str, n: usize) -> Vec<PriceBar> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default();
        (0..n)
            .map(|i| bar_on(symbol, start + Days::new(i as u64), i))
            .collect()
    }

    /// `n` valid bars spread evenly over `[first, last]`, both ends
    /// included. Dates are distinct while `n` does not exceed the span.
    pub fn bars_spanning(symbol: &str, first: NaiveDate, last: NaiveDate, n: usize) -> Vec<PriceBar> {
        let span = (last - first).num_days().max(0) as usize;
        (0..n)
            .map(|i| {
                let offset = if n <= 1 { 0 } else { i * span / (n - 1) };
                bar_on(symbol, first + Days::new(offset as u64), i)
            })
            .collect()
    }

    pub fn sample_fundamentals(symbol: &str, quarters: usize) -> Vec<FundamentalRecord> {
        let start = NaiveDate::from_ymd_opt(2022, 3, 31).unwrap_or_default();
        (0..quarters)
            .map(|q| FundamentalRecord {
                symbol: symbol.to_string(),
                period_end: start + Days::new(91 * q as u64),
                revenue: Some(1.0e9),
                net_income: Some(2.0e8),
                eps: Some(1.25),
                shares_outstanding: Some(160_000_000),
                profit_margin: Some(0.2),
            })
            .collect()
    }

    /// Monthly observations from 2020-01-01.
    pub fn sample_observations(series_id: &str, n: usize) -> Vec<EconomicObservation> {
        (0..n)
            .map(|i| EconomicObservation {
                series_id: series_id.to_string(),
                date: NaiveDate::from_ymd_opt(2020 + (i / 12) as i32, 1 + (i % 12) as u32, 1)
                    .unwrap_or_default(),
                value: Some(100.0 + i as f64 * 0.5),
                unit: Some("index".to_string()),
            })
            .collect()
    }

    /// `n` articles for `symbol`, one hour apart, newest last.
    pub fn sample_news(symbol: &str, n: usize) -> Vec<NewsArticle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        (0..n)
            .map(|i| NewsArticle {
                article_id: format!("{}-{}", symbol.to_lowercase(), i),
                symbol: Some(symbol.to_string()),
                published_at: start + chrono::TimeDelta::hours(i as i64),
                headline: Some(format!("{} headline {}", symbol, i)),
                source: Some("wire".to_string()),
                url: None,
                sentiment: Some(0.1),
            })
            .collect()
    }

    /// Default configuration.
    pub fn test_config() -> QuarryConfig {
        QuarryConfig::default()
    }

    pub fn into_records<T: Into<MarketRecord>>(items: Vec<T>) -> Vec<MarketRecord> {
        items.into_iter().map(Into::into).collect()
    }
}
