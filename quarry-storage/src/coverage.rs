//! Coverage tracking.
//!
//! A [`CoverageTracker`] keeps one [`CoverageRecord`] per `(entity_id,
//! data_type)` and decides whether a domain service should do a full
//! refresh, a delta refresh, or skip the provider and serve from the durable
//! tier. Records are created lazily and never deleted; `deactivate` is the
//! only way to stop refreshing an entity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use deadpool_postgres::Pool;
use quarry_core::{
    CoverageError, CoverageRecord, DataType, MarketRecord, QualityScorer, QuarryResult,
    RefreshPlan, RefreshPolicy, SharedClock, Timestamp, UpdateType,
};
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Persistence for coverage records.
#[async_trait]
pub trait CoverageStore: Send + Sync + 'static {
    /// Fetch the record for the pair, creating a zeroed active one if none
    /// exists. Concurrent callers for the same pair get the same record.
    async fn get_or_create(
        &self,
        entity_id: &str,
        data_type: DataType,
        source: &str,
        now: Timestamp,
    ) -> QuarryResult<CoverageRecord>;

    async fn get(&self, entity_id: &str, data_type: DataType)
        -> QuarryResult<Option<CoverageRecord>>;

    /// Overwrite the stored record for `(record.entity_id, record.data_type)`.
    async fn save(&self, record: &CoverageRecord) -> QuarryResult<()>;
}

fn store_failed(reason: impl ToString) -> CoverageError {
    CoverageError::StoreFailed {
        reason: reason.to_string(),
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Single-process coverage store.
#[derive(Debug, Default)]
pub struct MemoryCoverageStore {
    records: Mutex<HashMap<(String, DataType), CoverageRecord>>,
}

impl MemoryCoverageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CoverageStore for MemoryCoverageStore {
    async fn get_or_create(
        &self,
        entity_id: &str,
        data_type: DataType,
        source: &str,
        now: Timestamp,
    ) -> QuarryResult<CoverageRecord> {
        let mut records = self.records.lock().map_err(|_| store_failed("lock poisoned"))?;
        let record = records
            .entry((entity_id.to_string(), data_type))
            .or_insert_with(|| CoverageRecord::new(entity_id, data_type, source, now));
        Ok(record.clone())
    }

    async fn get(
        &self,
        entity_id: &str,
        data_type: DataType,
    ) -> QuarryResult<Option<CoverageRecord>> {
        let records = self.records.lock().map_err(|_| store_failed("lock poisoned"))?;
        Ok(records.get(&(entity_id.to_string(), data_type)).cloned())
    }

    async fn save(&self, record: &CoverageRecord) -> QuarryResult<()> {
        let mut records = self.records.lock().map_err(|_| store_failed("lock poisoned"))?;
        records.insert((record.entity_id.clone(), record.data_type), record.clone());
        Ok(())
    }
}

// ============================================================================
// POSTGRES STORE
// ============================================================================

const COVERAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS coverage_records (
    id                UUID             PRIMARY KEY,
    entity_id         TEXT             NOT NULL,
    data_type         TEXT             NOT NULL,
    is_active         BOOLEAN          NOT NULL,
    update_frequency  TEXT             NOT NULL,
    total_records     BIGINT           NOT NULL,
    first_date        DATE,
    last_date         DATE,
    last_full_update  TIMESTAMPTZ,
    last_delta_update TIMESTAMPTZ,
    next_update_due   TIMESTAMPTZ,
    source            TEXT             NOT NULL,
    quality_score     DOUBLE PRECISION,
    created_at        TIMESTAMPTZ      NOT NULL,
    updated_at        TIMESTAMPTZ      NOT NULL,
    UNIQUE (entity_id, data_type)
);
"#;

const COVERAGE_COLUMNS: &str = "id, entity_id, data_type, is_active, total_records, \
     first_date, last_date, last_full_update, last_delta_update, next_update_due, \
     source, quality_score, created_at, updated_at";

/// Coverage store on the `coverage_records` table.
#[derive(Clone)]
pub struct PgCoverageStore {
    pool: Pool,
}

impl PgCoverageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> QuarryResult<()> {
        let conn = self.conn().await?;
        conn.batch_execute(COVERAGE_SCHEMA).await.map_err(store_failed)?;
        info!("coverage_records schema ready");
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, CoverageError> {
        self.pool.get().await.map_err(store_failed)
    }

    fn decode(row: &Row) -> Result<CoverageRecord, CoverageError> {
        let data_type: String = row.try_get("data_type").map_err(store_failed)?;
        let data_type: DataType = data_type.parse().map_err(store_failed)?;
        let first_date: Option<NaiveDate> = row.try_get("first_date").map_err(store_failed)?;
        let last_date: Option<NaiveDate> = row.try_get("last_date").map_err(store_failed)?;
        let id: Uuid = row.try_get("id").map_err(store_failed)?;

        Ok(CoverageRecord {
            id,
            entity_id: row.try_get("entity_id").map_err(store_failed)?,
            data_type,
            is_active: row.try_get("is_active").map_err(store_failed)?,
            update_frequency: data_type.granularity(),
            total_records: row.try_get("total_records").map_err(store_failed)?,
            first_date,
            last_date,
            last_full_update: row.try_get("last_full_update").map_err(store_failed)?,
            last_delta_update: row.try_get("last_delta_update").map_err(store_failed)?,
            next_update_due: row.try_get("next_update_due").map_err(store_failed)?,
            source: row.try_get("source").map_err(store_failed)?,
            quality_score: row.try_get("quality_score").map_err(store_failed)?,
            created_at: row.try_get("created_at").map_err(store_failed)?,
            updated_at: row.try_get("updated_at").map_err(store_failed)?,
        })
    }
}

fn granularity_str(data_type: DataType) -> &'static str {
    match data_type.granularity() {
        quarry_core::Granularity::Fine => "fine",
        quarry_core::Granularity::Medium => "medium",
        quarry_core::Granularity::Coarse => "coarse",
    }
}

#[async_trait]
impl CoverageStore for PgCoverageStore {
    async fn get_or_create(
        &self,
        entity_id: &str,
        data_type: DataType,
        source: &str,
        now: Timestamp,
    ) -> QuarryResult<CoverageRecord> {
        let fresh = CoverageRecord::new(entity_id, data_type, source, now);
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO coverage_records \
             (id, entity_id, data_type, is_active, update_frequency, total_records, source, created_at, updated_at) \
             VALUES ($1, $2, $3, TRUE, $4, 0, $5, $6, $6) \
             ON CONFLICT (entity_id, data_type) DO NOTHING",
            &[
                &fresh.id,
                &entity_id,
                &data_type.as_str(),
                &granularity_str(data_type),
                &source,
                &now,
            ],
        )
        .await
        .map_err(store_failed)?;

        let sql = format!(
            "SELECT {} FROM coverage_records WHERE entity_id = $1 AND data_type = $2",
            COVERAGE_COLUMNS
        );
        let row = conn
            .query_one(sql.as_str(), &[&entity_id, &data_type.as_str()])
            .await
            .map_err(store_failed)?;
        Ok(Self::decode(&row)?)
    }

    async fn get(
        &self,
        entity_id: &str,
        data_type: DataType,
    ) -> QuarryResult<Option<CoverageRecord>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM coverage_records WHERE entity_id = $1 AND data_type = $2",
            COVERAGE_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&entity_id, &data_type.as_str()])
            .await
            .map_err(store_failed)?;
        Ok(row.as_ref().map(Self::decode).transpose()?)
    }

    async fn save(&self, record: &CoverageRecord) -> QuarryResult<()> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE coverage_records SET \
                 is_active = $3, total_records = $4, first_date = $5, last_date = $6, \
                 last_full_update = $7, last_delta_update = $8, next_update_due = $9, \
                 source = $10, quality_score = $11, updated_at = $12 \
                 WHERE entity_id = $1 AND data_type = $2",
                &[
                    &record.entity_id,
                    &record.data_type.as_str(),
                    &record.is_active,
                    &record.total_records,
                    &record.first_date,
                    &record.last_date,
                    &record.last_full_update,
                    &record.last_delta_update,
                    &record.next_update_due,
                    &record.source,
                    &record.quality_score,
                    &record.updated_at,
                ],
            )
            .await
            .map_err(store_failed)?;

        if updated == 0 {
            return Err(CoverageError::NotFound {
                entity_id: record.entity_id.clone(),
                data_type: record.data_type,
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// TRACKER
// ============================================================================

/// Decides refresh type per entity and folds fetch results into coverage.
pub struct CoverageTracker<S: CoverageStore> {
    store: Arc<S>,
    policy: RefreshPolicy,
    scorer: QualityScorer,
    clock: SharedClock,
    quality_max_age: Duration,
    source: String,
}

impl<S: CoverageStore> CoverageTracker<S> {
    pub fn new(
        store: Arc<S>,
        policy: RefreshPolicy,
        scorer: QualityScorer,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            policy,
            scorer,
            clock,
            quality_max_age: Duration::from_secs(7 * 24 * 3600),
            source: "unknown".to_string(),
        }
    }

    /// Name written to the `source` column of newly created records.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_quality_max_age(mut self, max_age: Duration) -> Self {
        self.quality_max_age = max_age;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn refresh_interval(&self, data_type: DataType) -> Duration {
        self.policy.refresh_interval(data_type)
    }

    pub fn delta_interval(&self, data_type: DataType) -> Duration {
        self.policy.delta_interval(data_type)
    }

    pub async fn get_or_create(
        &self,
        entity_id: &str,
        data_type: DataType,
    ) -> QuarryResult<CoverageRecord> {
        self.store
            .get_or_create(entity_id, data_type, &self.source, self.clock.now())
            .await
    }

    /// True before the first full update, and again once the data type's
    /// refresh interval has elapsed since the last one.
    pub fn needs_full_refresh(&self, record: &CoverageRecord) -> bool {
        record.needs_full_refresh(self.clock.now(), self.refresh_interval(record.data_type))
    }

    pub fn plan_refresh(&self, record: &CoverageRecord) -> RefreshPlan {
        record.plan(
            self.clock.now(),
            self.refresh_interval(record.data_type),
            self.delta_interval(record.data_type),
        )
    }

    /// Fold a successful fetch into `record`, persist it and return the
    /// updated copy. For a delta, `fetched` is the merged history.
    pub async fn update(
        &self,
        record: &CoverageRecord,
        fetched: &[MarketRecord],
        update_type: UpdateType,
    ) -> QuarryResult<CoverageRecord> {
        let now = self.clock.now();
        let quality = (!fetched.is_empty())
            .then(|| self.scorer.score_batch(fetched, now, self.quality_max_age).overall_score);

        let mut updated = record.clone();
        updated.apply_update(
            fetched,
            update_type,
            now,
            self.refresh_interval(record.data_type),
            quality,
        );
        self.store.save(&updated).await?;

        debug!(
            entity_id = %updated.entity_id,
            data_type = %updated.data_type,
            update_type = ?update_type,
            total_records = updated.total_records,
            "coverage updated"
        );
        Ok(updated)
    }

    /// Stop refreshing an entity. The record stays.
    pub async fn deactivate(
        &self,
        entity_id: &str,
        data_type: DataType,
    ) -> QuarryResult<CoverageRecord> {
        let mut record = self.get_or_create(entity_id, data_type).await?;
        if !record.is_active {
            return Ok(record);
        }
        record.is_active = false;
        record.updated_at = self.clock.now();
        self.store.save(&record).await?;
        warn!(entity_id, data_type = %data_type, "coverage deactivated");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Days, TimeZone, Utc};
    use quarry_core::{Clock, MockClock, PriceBar};

    const WEEK: Duration = Duration::from_secs(7 * 86_400);

    fn tracker() -> (CoverageTracker<MemoryCoverageStore>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let tracker = CoverageTracker::new(
            Arc::new(MemoryCoverageStore::new()),
            RefreshPolicy::default(),
            QualityScorer::default(),
            clock.clone(),
        )
        .with_source("test");
        (tracker, clock)
    }

    /// `count` daily bars spread evenly across 2023.
    fn year_of_bars(count: u64) -> Vec<MarketRecord> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        (0..count)
            .map(|i| {
                let date = start + Days::new(i * 364 / (count - 1));
                MarketRecord::from(PriceBar {
                    symbol: "AAPL".to_string(),
                    timestamp: Utc.from_utc_datetime(&date.and_hms_opt(21, 0, 0).unwrap()),
                    open: Some(100.0),
                    high: Some(101.0),
                    low: Some(99.0),
                    close: Some(100.5),
                    volume: Some(1_000),
                    adjusted_close: None,
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_use_creates_zeroed_record() {
        let (tracker, _clock) = tracker();
        let record = tracker.get_or_create("AAPL", DataType::Daily).await.unwrap();
        assert_eq!(record.total_records, 0);
        assert_eq!(record.source, "test");
        assert!(tracker.needs_full_refresh(&record));

        let again = tracker.get_or_create("AAPL", DataType::Daily).await.unwrap();
        assert_eq!(again.id, record.id);
        assert_eq!(tracker.store().len(), 1);
    }

    #[tokio::test]
    async fn test_full_update_year_of_bars() {
        let (tracker, clock) = tracker();
        let record = tracker.get_or_create("AAPL", DataType::Daily).await.unwrap();
        assert!(record.last_full_update.is_none());

        let updated = tracker
            .update(&record, &year_of_bars(100), UpdateType::Full)
            .await
            .unwrap();
        assert_eq!(updated.total_records, 100);
        assert_eq!(updated.first_date, NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(updated.last_date, NaiveDate::from_ymd_opt(2023, 12, 31));
        assert_eq!(updated.last_full_update, Some(clock.now()));
        assert_eq!(
            updated.next_update_due,
            Some(clock.now() + chrono::Duration::days(7))
        );
        assert_eq!(updated.quality_score, Some(100.0));
        assert!(!tracker.needs_full_refresh(&updated));

        let stored = tracker.store().get("AAPL", DataType::Daily).await.unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn test_threshold_elapses() {
        let (tracker, clock) = tracker();
        let record = tracker.get_or_create("AAPL", DataType::Daily).await.unwrap();
        let updated = tracker
            .update(&record, &year_of_bars(10), UpdateType::Full)
            .await
            .unwrap();

        assert_eq!(tracker.plan_refresh(&updated), RefreshPlan::Skip);

        clock.advance(WEEK - Duration::from_secs(60));
        assert!(!tracker.needs_full_refresh(&updated));
        let since = updated.last_date.unwrap();
        assert_eq!(tracker.plan_refresh(&updated), RefreshPlan::Delta { since });

        clock.advance(Duration::from_secs(60));
        assert!(tracker.needs_full_refresh(&updated));
        assert_eq!(tracker.plan_refresh(&updated), RefreshPlan::Full);
    }

    #[tokio::test]
    async fn test_delta_due_on_its_own_cadence() {
        let (tracker, clock) = tracker();
        let record = tracker.get_or_create("AAPL", DataType::Daily).await.unwrap();
        let updated = tracker
            .update(&record, &year_of_bars(10), UpdateType::Full)
            .await
            .unwrap();
        let delta = tracker.delta_interval(DataType::Daily);
        assert!(delta < tracker.refresh_interval(DataType::Daily));

        clock.advance(delta - Duration::from_secs(1));
        assert_eq!(tracker.plan_refresh(&updated), RefreshPlan::Skip);
        clock.advance(Duration::from_secs(1));
        let since = updated.last_date.unwrap();
        assert_eq!(tracker.plan_refresh(&updated), RefreshPlan::Delta { since });

        let mut merged = year_of_bars(10);
        merged.extend(year_of_bars(2).into_iter().map(|bar| match bar {
            MarketRecord::Bar(mut b) => {
                b.timestamp = b.timestamp + chrono::Duration::days(400);
                MarketRecord::Bar(b)
            }
            other => other,
        }));
        let after = tracker
            .update(&updated, &merged, UpdateType::Delta)
            .await
            .unwrap();
        assert_eq!(after.total_records, 12);
        assert_eq!(after.last_full_update, updated.last_full_update);
        assert_eq!(after.last_delta_update, Some(clock.now()));
        assert_eq!(tracker.plan_refresh(&after), RefreshPlan::Skip);
    }

    #[tokio::test]
    async fn test_coarse_interval_for_fundamentals() {
        let (tracker, clock) = tracker();
        let record = tracker
            .get_or_create("MSFT", DataType::Fundamentals)
            .await
            .unwrap();
        let updated = tracker.update(&record, &[], UpdateType::Full).await.unwrap();
        assert_eq!(updated.quality_score, None);

        clock.advance(Duration::from_secs(59 * 86_400));
        assert!(!tracker.needs_full_refresh(&updated));
        clock.advance(Duration::from_secs(86_400));
        assert!(tracker.needs_full_refresh(&updated));
    }

    #[tokio::test]
    async fn test_deactivate_keeps_record() {
        let (tracker, _clock) = tracker();
        tracker.get_or_create("AAPL", DataType::News).await.unwrap();

        let record = tracker.deactivate("AAPL", DataType::News).await.unwrap();
        assert!(!record.is_active);
        assert_eq!(tracker.plan_refresh(&record), RefreshPlan::Skip);

        let stored = tracker.store().get("AAPL", DataType::News).await.unwrap().unwrap();
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_is_single_record() {
        let (tracker, _clock) = tracker();
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker.get_or_create("AAPL", DataType::Daily).await.unwrap().id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }
}
