//! Tagged market-data records.
//!
//! Every cached payload is a `Vec<MarketRecord>`. The enum is serialized with
//! an explicit `kind` tag so a round-trip through either tier cannot silently
//! reinterpret a fundamentals row as a price bar.
//!
//! Numeric fields are `Option` because providers hand back partially parsed
//! rows; the quality scorer counts the gaps instead of the parser rejecting
//! them.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RecordKind;

/// OHLCV bar for one symbol at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_close: Option<f64>,
}

/// One reporting period of company fundamentals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalRecord {
    pub symbol: String,
    pub period_end: NaiveDate,
    pub revenue: Option<f64>,
    pub net_income: Option<f64>,
    pub eps: Option<f64>,
    pub shares_outstanding: Option<i64>,
    /// Net income over revenue, as a fraction in [-1, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_margin: Option<f64>,
}

/// One observation of a macroeconomic series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicObservation {
    pub series_id: String,
    pub date: NaiveDate,
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// A news item, optionally tied to a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub article_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub published_at: DateTime<Utc>,
    pub headline: Option<String>,
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Sentiment in [-1, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<f64>,
}

/// A single cached domain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MarketRecord {
    Bar(PriceBar),
    Fundamental(FundamentalRecord),
    Economic(EconomicObservation),
    News(NewsArticle),
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

impl MarketRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            MarketRecord::Bar(_) => RecordKind::Bar,
            MarketRecord::Fundamental(_) => RecordKind::Fundamental,
            MarketRecord::Economic(_) => RecordKind::Economic,
            MarketRecord::News(_) => RecordKind::News,
        }
    }

    /// Entity half of the natural key.
    pub fn entity_id(&self) -> &str {
        match self {
            MarketRecord::Bar(bar) => &bar.symbol,
            MarketRecord::Fundamental(f) => &f.symbol,
            MarketRecord::Economic(obs) => &obs.series_id,
            MarketRecord::News(article) => &article.article_id,
        }
    }

    /// Timestamp half of the natural key. Date-only records are pinned to
    /// midnight UTC.
    pub fn as_of(&self) -> DateTime<Utc> {
        match self {
            MarketRecord::Bar(bar) => bar.timestamp,
            MarketRecord::Fundamental(f) => start_of_day(f.period_end),
            MarketRecord::Economic(obs) => start_of_day(obs.date),
            MarketRecord::News(article) => article.published_at,
        }
    }

    pub fn as_of_date(&self) -> NaiveDate {
        match self {
            MarketRecord::Fundamental(f) => f.period_end,
            MarketRecord::Economic(obs) => obs.date,
            _ => self.as_of().date_naive(),
        }
    }

    /// Natural composite key used by the durable tier.
    pub fn natural_key(&self) -> (RecordKind, &str, DateTime<Utc>) {
        (self.kind(), self.entity_id(), self.as_of())
    }
}

impl From<PriceBar> for MarketRecord {
    fn from(bar: PriceBar) -> Self {
        MarketRecord::Bar(bar)
    }
}

impl From<FundamentalRecord> for MarketRecord {
    fn from(record: FundamentalRecord) -> Self {
        MarketRecord::Fundamental(record)
    }
}

impl From<EconomicObservation> for MarketRecord {
    fn from(obs: EconomicObservation) -> Self {
        MarketRecord::Economic(obs)
    }
}

impl From<NewsArticle> for MarketRecord {
    fn from(article: NewsArticle) -> Self {
        MarketRecord::News(article)
    }
}

/// Earliest and latest record dates in a batch, or `None` for an empty batch.
pub fn date_span(records: &[MarketRecord]) -> Option<(NaiveDate, NaiveDate)> {
    let mut dates = records.iter().map(MarketRecord::as_of_date);
    let first = dates.next()?;
    Some(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
}
