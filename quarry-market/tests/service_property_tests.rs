//! Property-Based Tests for the market-data services
//!
//! Any provider-shaped input must come back out of the services with its
//! dates intact, and coverage must describe exactly what was fetched.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use proptest::prelude::*;
use quarry_core::{DataType, QualityScorer, ReadStatus, SharedClock, Tier};
use quarry_market::{InMemoryPlatform, SharedProvider};
use quarry_test_utils::fixtures::{into_records, test_config};
use quarry_test_utils::generators::{arb_bars, arb_cache_key, arb_market_record};
use quarry_test_utils::{CacheKey, MockClock, ScriptedProvider};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn platform(provider: ScriptedProvider) -> (InMemoryPlatform, Arc<ScriptedProvider>) {
    let provider = provider.shared();
    let platform = InMemoryPlatform::in_memory(
        test_config(),
        provider.clone() as SharedProvider,
        Arc::new(MockClock::new()) as SharedClock,
    );
    (platform, provider)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Coverage extent always matches the batch a full refresh returned.
    #[test]
    fn prop_full_refresh_coverage_matches_batch(bars in arb_bars("PROP".to_string(), 40)) {
        let rt = runtime();
        let (platform, provider) = platform(ScriptedProvider::new().with_bars("PROP", bars.clone()));

        rt.block_on(async {
            let response = platform.stocks().daily_bars("PROP").await;
            prop_assert_eq!(response.tier, Some(Tier::Source));
            prop_assert_eq!(response.records.len(), bars.len());
            prop_assert_eq!(provider.call_count("fetch_bars"), 1);

            let record = platform
                .coverage()
                .get_or_create("PROP", DataType::Daily)
                .await
                .unwrap();
            let first = bars.iter().map(|b| b.timestamp.date_naive()).min();
            let last = bars.iter().map(|b| b.timestamp.date_naive()).max();
            prop_assert_eq!(record.total_records, bars.len() as i64);
            prop_assert_eq!(record.first_date, first);
            prop_assert_eq!(record.last_date, last);
            prop_assert!(record.quality_score.is_some());
            Ok(())
        })?;
    }

    /// Ranged reads never return a row outside the requested dates.
    #[test]
    fn prop_ranged_reads_stay_in_bounds(
        bars in arb_bars("PROP".to_string(), 40),
        a in 0u64..2_000,
        b in 0u64..2_000,
    ) {
        let rt = runtime();
        let (platform, _provider) = platform(ScriptedProvider::new().with_bars("PROP", bars));
        let base = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let start = base + chrono::Days::new(a.min(b));
        let end = base + chrono::Days::new(a.max(b));

        rt.block_on(async {
            for response in [
                platform.stocks().daily_bars_between("PROP", Some(start), Some(end)).await,
                platform.stocks().bars("PROP", DataType::Weekly, Some(start), Some(end)).await,
            ] {
                prop_assert!(response.status != ReadStatus::Stale);
                for record in &response.records {
                    prop_assert!(record.as_of_date() >= start && record.as_of_date() <= end);
                }
            }
            Ok(())
        })?;
    }

    /// Scores stay in range whatever the provider hands back.
    #[test]
    fn prop_quality_score_bounded(records in prop::collection::vec(arb_market_record(), 0..30)) {
        let scorer = QualityScorer::default();
        let now = MockClock::new();
        let score = scorer.score_batch(
            &records,
            quarry_core::Clock::now(&now),
            Duration::from_secs(7 * 86_400),
        );
        prop_assert!((0.0..=100.0).contains(&score.overall_score));
    }

    /// Rendered keys parse back and stored keys fit the backend limit.
    #[test]
    fn prop_cache_key_storage_form(key in arb_cache_key()) {
        let rendered = key.render();
        prop_assert_eq!(CacheKey::parse(&rendered), Some(key.clone()));
        prop_assert!(key.storage_key().len() <= quarry_core::MAX_STORED_KEY_LEN);
    }
}

#[test]
fn test_fixture_records_convert() {
    let records = into_records(quarry_test_utils::fixtures::sample_bars("SPY", 3));
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.entity_id() == "SPY"));
}
