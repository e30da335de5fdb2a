//! Advisory record-quality scoring.
//!
//! Every fetched record starts at 100 and loses points per problem found:
//! a missing required field, a cross-field inconsistency (`high < low`, a
//! bounded ratio outside its bounds) or an out-of-domain value (negative
//! volume, NaN). The score is attached to cached data as metadata and never
//! prevents a write.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::elapsed;
use crate::record::{EconomicObservation, FundamentalRecord, MarketRecord, NewsArticle, PriceBar};
use crate::{Timestamp, ValidationWarning};

/// Which class of rule an issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRule {
    MissingField,
    Inconsistent,
    OutOfDomain,
}

/// A single problem found on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub rule: QualityRule,
    pub field: String,
    pub message: String,
}

impl QualityIssue {
    pub fn new(rule: QualityRule, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule,
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result of scoring one record or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// 0-100, clamped.
    pub overall_score: f64,
    pub completeness: f64,
    pub consistency: f64,
    pub timeliness: f64,
    pub issues: Vec<QualityIssue>,
}

impl QualityScore {
    pub fn perfect() -> Self {
        Self {
            overall_score: 100.0,
            completeness: 100.0,
            consistency: 100.0,
            timeliness: 100.0,
            issues: Vec::new(),
        }
    }

    pub fn count(&self, rule: QualityRule) -> usize {
        self.issues.iter().filter(|i| i.rule == rule).count()
    }
}

/// Points deducted per issue class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub missing_field: f64,
    pub inconsistency: f64,
    pub out_of_domain: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            missing_field: 20.0,
            inconsistency: 30.0,
            out_of_domain: 15.0,
        }
    }
}

/// Per-schema validation rules.
///
/// Implemented for each record struct; [`QualityScorer`] only knows how to
/// turn the answers into a score.
pub trait QualityRules {
    /// Required fields paired with whether each is present.
    fn required_fields(&self) -> Vec<(&'static str, bool)>;

    /// Cross-field ordering and bound checks.
    fn check_consistency(&self) -> Vec<QualityIssue>;

    /// Single-field domain checks (sign, finiteness).
    fn check_domain(&self) -> Vec<QualityIssue>;
}

// ============================================================================
// RULE HELPERS
// ============================================================================

fn non_negative(field: &'static str, value: Option<f64>, issues: &mut Vec<QualityIssue>) {
    match value {
        Some(v) if !v.is_finite() => issues.push(QualityIssue::new(
            QualityRule::OutOfDomain,
            field,
            format!("{} is not a finite number", field),
        )),
        Some(v) if v < 0.0 => issues.push(QualityIssue::new(
            QualityRule::OutOfDomain,
            field,
            format!("{} is negative ({})", field, v),
        )),
        _ => {}
    }
}

fn finite(field: &'static str, value: Option<f64>, issues: &mut Vec<QualityIssue>) {
    if let Some(v) = value {
        if !v.is_finite() {
            issues.push(QualityIssue::new(
                QualityRule::OutOfDomain,
                field,
                format!("{} is not a finite number", field),
            ));
        }
    }
}

fn within_unit_range(field: &'static str, value: Option<f64>, issues: &mut Vec<QualityIssue>) {
    if let Some(v) = value {
        if v.is_finite() && !(-1.0..=1.0).contains(&v) {
            issues.push(QualityIssue::new(
                QualityRule::Inconsistent,
                field,
                format!("{} {} outside [-1, 1]", field, v),
            ));
        }
    }
}

fn missing_text(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

// ============================================================================
// RULES PER RECORD
// ============================================================================

impl QualityRules for PriceBar {
    fn required_fields(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("open", self.open.is_some()),
            ("high", self.high.is_some()),
            ("low", self.low.is_some()),
            ("close", self.close.is_some()),
            ("volume", self.volume.is_some()),
        ]
    }

    fn check_consistency(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        let (Some(high), Some(low)) = (self.high, self.low) else {
            return issues;
        };
        if high < low {
            issues.push(QualityIssue::new(
                QualityRule::Inconsistent,
                "high",
                format!("high {} below low {}", high, low),
            ));
            // Bounds are meaningless once inverted.
            return issues;
        }
        for (field, value) in [("open", self.open), ("close", self.close)] {
            if let Some(v) = value {
                if v < low || v > high {
                    issues.push(QualityIssue::new(
                        QualityRule::Inconsistent,
                        field,
                        format!("{} {} outside [{}, {}]", field, v, low, high),
                    ));
                }
            }
        }
        issues
    }

    fn check_domain(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        non_negative("open", self.open, &mut issues);
        non_negative("high", self.high, &mut issues);
        non_negative("low", self.low, &mut issues);
        non_negative("close", self.close, &mut issues);
        non_negative("adjusted_close", self.adjusted_close, &mut issues);
        if let Some(volume) = self.volume {
            if volume < 0 {
                issues.push(QualityIssue::new(
                    QualityRule::OutOfDomain,
                    "volume",
                    format!("volume is negative ({})", volume),
                ));
            }
        }
        issues
    }
}

impl QualityRules for FundamentalRecord {
    fn required_fields(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("revenue", self.revenue.is_some()),
            ("net_income", self.net_income.is_some()),
            ("eps", self.eps.is_some()),
            ("shares_outstanding", self.shares_outstanding.is_some()),
        ]
    }

    fn check_consistency(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        within_unit_range("profit_margin", self.profit_margin, &mut issues);
        issues
    }

    fn check_domain(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        non_negative("revenue", self.revenue, &mut issues);
        finite("net_income", self.net_income, &mut issues);
        finite("eps", self.eps, &mut issues);
        finite("profit_margin", self.profit_margin, &mut issues);
        if let Some(shares) = self.shares_outstanding {
            if shares < 0 {
                issues.push(QualityIssue::new(
                    QualityRule::OutOfDomain,
                    "shares_outstanding",
                    format!("shares_outstanding is negative ({})", shares),
                ));
            }
        }
        issues
    }
}

impl QualityRules for EconomicObservation {
    fn required_fields(&self) -> Vec<(&'static str, bool)> {
        vec![("value", self.value.is_some())]
    }

    fn check_consistency(&self) -> Vec<QualityIssue> {
        Vec::new()
    }

    fn check_domain(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        finite("value", self.value, &mut issues);
        issues
    }
}

impl QualityRules for NewsArticle {
    fn required_fields(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("headline", !missing_text(&self.headline)),
            ("source", !missing_text(&self.source)),
        ]
    }

    fn check_consistency(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        within_unit_range("sentiment", self.sentiment, &mut issues);
        issues
    }

    fn check_domain(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        finite("sentiment", self.sentiment, &mut issues);
        issues
    }
}

impl QualityRules for MarketRecord {
    fn required_fields(&self) -> Vec<(&'static str, bool)> {
        match self {
            MarketRecord::Bar(r) => r.required_fields(),
            MarketRecord::Fundamental(r) => r.required_fields(),
            MarketRecord::Economic(r) => r.required_fields(),
            MarketRecord::News(r) => r.required_fields(),
        }
    }

    fn check_consistency(&self) -> Vec<QualityIssue> {
        match self {
            MarketRecord::Bar(r) => r.check_consistency(),
            MarketRecord::Fundamental(r) => r.check_consistency(),
            MarketRecord::Economic(r) => r.check_consistency(),
            MarketRecord::News(r) => r.check_consistency(),
        }
    }

    fn check_domain(&self) -> Vec<QualityIssue> {
        match self {
            MarketRecord::Bar(r) => r.check_domain(),
            MarketRecord::Fundamental(r) => r.check_domain(),
            MarketRecord::Economic(r) => r.check_domain(),
            MarketRecord::News(r) => r.check_domain(),
        }
    }
}

// ============================================================================
// SCORER
// ============================================================================

/// Turns rule findings into a 0-100 score.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityScorer {
    weights: QualityWeights,
    warning_threshold: f64,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(QualityWeights::default(), 60.0)
    }
}

impl QualityScorer {
    pub fn new(weights: QualityWeights, warning_threshold: f64) -> Self {
        Self {
            weights,
            warning_threshold,
        }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    pub fn warning_threshold(&self) -> f64 {
        self.warning_threshold
    }

    /// Score a single record.
    ///
    /// A record with every required field missing carries no data at all
    /// and scores exactly 0 whatever its schema's field count.
    pub fn validate<R: QualityRules + ?Sized>(&self, record: &R) -> QualityScore {
        let required = record.required_fields();
        let mut issues: Vec<QualityIssue> = required
            .iter()
            .filter(|(_, present)| !present)
            .map(|(field, _)| {
                QualityIssue::new(
                    QualityRule::MissingField,
                    *field,
                    format!("required field {} is missing", field),
                )
            })
            .collect();
        let missing = issues.len();
        let present = required.len() - missing;

        let inconsistencies = record.check_consistency();
        let out_of_domain = record.check_domain();
        let n_inconsistent = inconsistencies.len();
        let n_out_of_domain = out_of_domain.len();
        issues.extend(inconsistencies);
        issues.extend(out_of_domain);

        let completeness = if required.is_empty() {
            100.0
        } else {
            100.0 * present as f64 / required.len() as f64
        };
        let consistency =
            (100.0 - self.weights.inconsistency * n_inconsistent as f64).clamp(0.0, 100.0);

        let overall_score = if !required.is_empty() && present == 0 {
            0.0
        } else {
            (100.0
                - self.weights.missing_field * missing as f64
                - self.weights.inconsistency * n_inconsistent as f64
                - self.weights.out_of_domain * n_out_of_domain as f64)
                .clamp(0.0, 100.0)
        };

        QualityScore {
            overall_score,
            completeness,
            consistency,
            timeliness: 100.0,
            issues,
        }
    }

    /// Score a fetched batch.
    ///
    /// Overall, completeness and consistency are the per-record means.
    /// Timeliness is 100 when the newest record is within `max_age` of
    /// `now`, else 50. An empty batch scores 0 across the board.
    pub fn score_batch(
        &self,
        records: &[MarketRecord],
        now: Timestamp,
        max_age: Duration,
    ) -> QualityScore {
        let Some(newest) = records.iter().map(MarketRecord::as_of).max() else {
            return QualityScore {
                overall_score: 0.0,
                completeness: 0.0,
                consistency: 0.0,
                timeliness: 0.0,
                issues: Vec::new(),
            };
        };

        let n = records.len() as f64;
        let mut overall = 0.0;
        let mut completeness = 0.0;
        let mut consistency = 0.0;
        let mut issues = Vec::new();
        for record in records {
            let score = self.validate(record);
            overall += score.overall_score;
            completeness += score.completeness;
            consistency += score.consistency;
            issues.extend(score.issues.into_iter().map(|mut issue| {
                issue.message = format!("{} @ {}: {}", record.entity_id(), record.as_of(), issue.message);
                issue
            }));
        }

        let timeliness = if elapsed(newest, now) <= max_age {
            100.0
        } else {
            50.0
        };

        QualityScore {
            overall_score: (overall / n).clamp(0.0, 100.0),
            completeness: completeness / n,
            consistency: consistency / n,
            timeliness,
            issues,
        }
    }

    pub fn is_warning(&self, score: &QualityScore) -> bool {
        score.overall_score < self.warning_threshold
    }

    /// The warning to log for `score`, if it falls below the threshold.
    pub fn warning_for(&self, cache_key: &str, score: &QualityScore) -> Option<ValidationWarning> {
        self.is_warning(score).then(|| ValidationWarning {
            cache_key: cache_key.to_string(),
            score: score.overall_score,
            threshold: self.warning_threshold,
            issue_count: score.issues.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: i64) -> PriceBar {
        PriceBar {
            symbol: "AAPL".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap(),
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            volume: Some(volume),
            adjusted_close: None,
        }
    }

    fn empty_bar() -> PriceBar {
        PriceBar {
            symbol: "AAPL".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap(),
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            adjusted_close: None,
        }
    }

    #[test]
    fn test_valid_bar_scores_100() {
        let score = QualityScorer::default().validate(&bar(10.0, 12.0, 9.0, 11.0, 1000));
        assert_eq!(score.overall_score, 100.0);
        assert!(score.issues.is_empty());
    }

    #[test]
    fn test_all_missing_scores_zero() {
        let score = QualityScorer::default().validate(&empty_bar());
        assert_eq!(score.overall_score, 0.0);
        assert_eq!(score.completeness, 0.0);
        assert_eq!(score.count(QualityRule::MissingField), 5);

        let obs = EconomicObservation {
            series_id: "GDP".to_string(),
            date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            value: None,
            unit: None,
        };
        assert_eq!(QualityScorer::default().validate(&obs).overall_score, 0.0);
    }

    #[test]
    fn test_high_below_low_deducts_30() {
        let score = QualityScorer::default().validate(&bar(10.0, 9.0, 12.0, 10.0, 100));
        assert_eq!(score.overall_score, 70.0);
        assert_eq!(score.count(QualityRule::Inconsistent), 1);
    }

    #[test]
    fn test_close_outside_range() {
        let score = QualityScorer::default().validate(&bar(10.0, 12.0, 9.0, 13.0, 100));
        assert_eq!(score.overall_score, 70.0);
        assert_eq!(score.issues[0].field, "close");
    }

    #[test]
    fn test_negative_volume_deducts_15() {
        let score = QualityScorer::default().validate(&bar(10.0, 12.0, 9.0, 11.0, -5));
        assert_eq!(score.overall_score, 85.0);
        assert_eq!(score.count(QualityRule::OutOfDomain), 1);
    }

    #[test]
    fn test_one_missing_field_deducts_20() {
        let mut b = bar(10.0, 12.0, 9.0, 11.0, 100);
        b.volume = None;
        let score = QualityScorer::default().validate(&b);
        assert_eq!(score.overall_score, 80.0);
        assert_eq!(score.completeness, 80.0);
    }

    #[test]
    fn test_profit_margin_bounds() {
        let record = FundamentalRecord {
            symbol: "MSFT".to_string(),
            period_end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            revenue: Some(62.0e9),
            net_income: Some(21.9e9),
            eps: Some(2.93),
            shares_outstanding: Some(7_430_000_000),
            profit_margin: Some(1.4),
        };
        let score = QualityScorer::default().validate(&record);
        assert_eq!(score.overall_score, 70.0);
    }

    #[test]
    fn test_news_blank_headline_is_missing() {
        let article = NewsArticle {
            article_id: "n-1".to_string(),
            symbol: Some("AAPL".to_string()),
            published_at: Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap(),
            headline: Some("   ".to_string()),
            source: Some("wire".to_string()),
            url: None,
            sentiment: Some(0.2),
        };
        let score = QualityScorer::default().validate(&article);
        assert_eq!(score.overall_score, 80.0);
    }

    #[test]
    fn test_custom_weights() {
        let scorer = QualityScorer::new(
            QualityWeights {
                missing_field: 5.0,
                inconsistency: 10.0,
                out_of_domain: 1.0,
            },
            60.0,
        );
        let score = scorer.validate(&bar(10.0, 9.0, 12.0, 10.0, -1));
        assert_eq!(score.overall_score, 89.0);
    }

    #[test]
    fn test_score_batch_timeliness_and_mean() {
        let scorer = QualityScorer::default();
        let records = vec![
            MarketRecord::from(bar(10.0, 12.0, 9.0, 11.0, 100)),
            MarketRecord::from(empty_bar()),
        ];
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

        let fresh = scorer.score_batch(&records, now, Duration::from_secs(7 * 86_400));
        assert_eq!(fresh.overall_score, 50.0);
        assert_eq!(fresh.timeliness, 100.0);
        assert_eq!(fresh.issues.len(), 5);
        assert!(fresh.issues[0].message.starts_with("AAPL @"));

        let old = scorer.score_batch(&records, now, Duration::from_secs(3600));
        assert_eq!(old.timeliness, 50.0);

        assert_eq!(
            scorer.score_batch(&[], now, Duration::from_secs(1)).overall_score,
            0.0
        );
    }

    #[test]
    fn test_warning_threshold() {
        let scorer = QualityScorer::default();
        let low = scorer.validate(&empty_bar());
        let warning = scorer.warning_for("AAPL:daily", &low).unwrap();
        assert_eq!(warning.threshold, 60.0);
        assert_eq!(warning.issue_count, 5);

        let ok = scorer.validate(&bar(10.0, 12.0, 9.0, 11.0, 100));
        assert!(scorer.warning_for("AAPL:daily", &ok).is_none());
    }
}
