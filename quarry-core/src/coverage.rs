//! Per-entity coverage metadata.
//!
//! Coverage records answer "how much history do we hold for this entity and
//! when is it due again", on a scale of days. Cache TTLs are measured in
//! hours, so the two are tracked separately.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::{add_duration, elapsed};
use crate::record::{date_span, MarketRecord};
use crate::{new_entity_id, DataType, EntityId, Granularity, Timestamp, UpdateType};

/// Freshness metadata for one `(entity_id, data_type)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub id: EntityId,
    pub entity_id: String,
    pub data_type: DataType,
    pub is_active: bool,
    pub update_frequency: Granularity,
    pub total_records: i64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub last_full_update: Option<Timestamp>,
    pub last_delta_update: Option<Timestamp>,
    pub next_update_due: Option<Timestamp>,
    pub source: String,
    pub quality_score: Option<f64>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// What a domain service should do for an entity right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "lowercase")]
pub enum RefreshPlan {
    /// Refetch the whole history.
    Full,
    /// Fetch only what came after `since`.
    Delta { since: NaiveDate },
    /// Nothing due; serve from the durable tier.
    Skip,
}

impl CoverageRecord {
    /// A zeroed, active record.
    pub fn new(
        entity_id: impl Into<String>,
        data_type: DataType,
        source: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: new_entity_id(),
            entity_id: entity_id.into(),
            data_type,
            is_active: true,
            update_frequency: data_type.granularity(),
            total_records: 0,
            first_date: None,
            last_date: None,
            last_full_update: None,
            last_delta_update: None,
            next_update_due: None,
            source: source.into(),
            quality_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True before the first full update and again once `interval` has
    /// elapsed since the last one.
    pub fn needs_full_refresh(&self, now: Timestamp, interval: Duration) -> bool {
        match self.last_full_update {
            None => true,
            Some(last) => elapsed(last, now) >= interval,
        }
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_update_due.map_or(true, |due| due <= now)
    }

    /// Most recent successful update of either kind.
    pub fn last_update(&self) -> Option<Timestamp> {
        self.last_full_update.max(self.last_delta_update)
    }

    /// True once `delta_interval` has passed since the last update, or once
    /// `next_update_due` has passed, whichever comes first.
    pub fn delta_due(&self, now: Timestamp, delta_interval: Duration) -> bool {
        let cadence = self
            .last_update()
            .map_or(true, |last| elapsed(last, now) >= delta_interval);
        cadence || self.is_due(now)
    }

    /// Full once `full_interval` has elapsed since the last full update,
    /// otherwise a delta from `last_date` once a delta is due.
    pub fn plan(
        &self,
        now: Timestamp,
        full_interval: Duration,
        delta_interval: Duration,
    ) -> RefreshPlan {
        if !self.is_active {
            return RefreshPlan::Skip;
        }
        if self.needs_full_refresh(now, full_interval) {
            return RefreshPlan::Full;
        }
        if !self.delta_due(now, delta_interval) {
            return RefreshPlan::Skip;
        }
        match self.last_date {
            Some(since) => RefreshPlan::Delta { since },
            None => RefreshPlan::Full,
        }
    }

    /// Fold a successful fetch into the record.
    ///
    /// `fetched` is the whole stored series after the update: a delta
    /// caller passes the merged history, not just the new rows. Count and
    /// date span always describe that batch.
    pub fn apply_update(
        &mut self,
        fetched: &[MarketRecord],
        update_type: UpdateType,
        now: Timestamp,
        interval: Duration,
        quality_score: Option<f64>,
    ) {
        let span = date_span(fetched);
        self.total_records = fetched.len() as i64;
        self.first_date = span.map(|(first, _)| first);
        self.last_date = span.map(|(_, last)| last);
        match update_type {
            UpdateType::Full => self.last_full_update = Some(now),
            UpdateType::Delta => self.last_delta_update = Some(now),
        }
        self.next_update_due = Some(add_duration(now, interval));
        if quality_score.is_some() {
            self.quality_score = quality_score;
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::record::PriceBar;
    use chrono::{Days, TimeZone, Utc};

    const DAY: Duration = Duration::from_secs(86_400);
    const WEEK: Duration = Duration::from_secs(7 * 86_400);

    fn bars_spanning(start: NaiveDate, count: u64) -> Vec<MarketRecord> {
        (0..count)
            .map(|i| {
                let date = start + Days::new(i);
                MarketRecord::from(PriceBar {
                    symbol: "AAPL".to_string(),
                    timestamp: Utc
                        .from_utc_datetime(&date.and_hms_opt(21, 0, 0).unwrap()),
                    open: Some(1.0),
                    high: Some(1.0),
                    low: Some(1.0),
                    close: Some(1.0),
                    volume: Some(1),
                    adjusted_close: None,
                })
            })
            .collect()
    }

    #[test]
    fn test_new_record_is_zeroed() {
        let clock = MockClock::new();
        let record = CoverageRecord::new("AAPL", DataType::Daily, "test", clock.now());
        assert!(record.is_active);
        assert_eq!(record.total_records, 0);
        assert_eq!(record.update_frequency, Granularity::Fine);
        assert!(record.last_full_update.is_none());
        assert!(record.needs_full_refresh(clock.now(), WEEK));
        assert_eq!(record.plan(clock.now(), WEEK, DAY), RefreshPlan::Full);
    }

    #[test]
    fn test_full_update_then_threshold() {
        let clock = MockClock::new();
        let mut record = CoverageRecord::new("AAPL", DataType::Daily, "test", clock.now());
        let fetched = bars_spanning(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(), 100);

        record.apply_update(&fetched, UpdateType::Full, clock.now(), WEEK, Some(95.0));
        assert_eq!(record.total_records, 100);
        assert_eq!(record.first_date, NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(record.last_date, NaiveDate::from_ymd_opt(2023, 4, 10));
        assert_eq!(
            record.next_update_due,
            Some(record.last_full_update.unwrap() + chrono::Duration::days(7))
        );
        assert!(!record.needs_full_refresh(clock.now(), WEEK));
        assert_eq!(record.plan(clock.now(), WEEK, DAY), RefreshPlan::Skip);

        clock.advance(WEEK - Duration::from_secs(1));
        assert!(!record.needs_full_refresh(clock.now(), WEEK));
        clock.advance(Duration::from_secs(1));
        assert!(record.needs_full_refresh(clock.now(), WEEK));
    }

    #[test]
    fn test_delta_counts_merged_batch() {
        let clock = MockClock::new();
        let mut record = CoverageRecord::new("AAPL", DataType::Daily, "test", clock.now());
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        record.apply_update(&bars_spanning(start, 10), UpdateType::Full, clock.now(), WEEK, None);
        let full_at = record.last_full_update;

        // History plus three new days, one of them overlapping the old tail.
        let merged = bars_spanning(start, 12);
        clock.advance(DAY);
        record.apply_update(&merged, UpdateType::Delta, clock.now(), WEEK, Some(88.0));
        assert_eq!(record.total_records, 12);
        assert_eq!(record.first_date, Some(start));
        assert_eq!(record.last_date, Some(start + Days::new(11)));
        assert_eq!(record.last_delta_update, Some(clock.now()));
        assert_eq!(record.last_full_update, full_at);
        assert_eq!(record.quality_score, Some(88.0));
    }

    #[test]
    fn test_delta_falls_due_before_full() {
        let clock = MockClock::new();
        let mut record = CoverageRecord::new("AAPL", DataType::Daily, "test", clock.now());
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        record.apply_update(&bars_spanning(start, 5), UpdateType::Full, clock.now(), WEEK, None);

        clock.advance(DAY - Duration::from_secs(1));
        assert_eq!(record.plan(clock.now(), WEEK, DAY), RefreshPlan::Skip);
        clock.advance(Duration::from_secs(1));
        let since = start + Days::new(4);
        assert_eq!(record.plan(clock.now(), WEEK, DAY), RefreshPlan::Delta { since });

        // Each delta pushes the next one out by the delta cadence only.
        let merged = bars_spanning(start, 6);
        record.apply_update(&merged, UpdateType::Delta, clock.now(), WEEK, None);
        assert_eq!(record.plan(clock.now(), WEEK, DAY), RefreshPlan::Skip);
        clock.advance(DAY);
        assert_eq!(
            record.plan(clock.now(), WEEK, DAY),
            RefreshPlan::Delta {
                since: start + Days::new(5)
            }
        );

        // The full interval still wins once it has elapsed.
        clock.advance(5 * DAY);
        assert_eq!(record.plan(clock.now(), WEEK, DAY), RefreshPlan::Full);
    }

    #[test]
    fn test_inactive_is_never_refreshed() {
        let clock = MockClock::new();
        let mut record = CoverageRecord::new("AAPL", DataType::Daily, "test", clock.now());
        record.is_active = false;
        assert_eq!(record.plan(clock.now(), WEEK, DAY), RefreshPlan::Skip);
    }
}
