//! Tiered read-through cache.
//!
//! Lookup order for [`CacheOrchestrator::get`]:
//!
//! 1. local tier within the caller's TTL
//! 2. durable tier within `policy.durable_ttl` (backfills local on hit)
//! 3. the caller's refresh closure, coalesced per key through
//!    [`SingleFlight`], written through to both tiers
//! 4. local tier ignoring TTL, served as stale
//!
//! Every tier failure is logged and treated as a miss; reads never return
//! an error. What the caller got is described by [`CacheResponse`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quarry_core::{
    CacheKey, CachePolicy, HealthCheck, MarketRecord, QualityScore, QualityScorer, QuarryResult,
    ReadStatus, RefreshError, SharedClock, Tier, Timestamp,
};
use tracing::{debug, error, warn};

use crate::cache::{
    CacheResponse, CacheStats, CachedBatch, DurableScope, DurableTier, Freshness, LocalTier,
};
use crate::single_flight::SingleFlight;

/// What a refresh closure resolves to.
pub type RefreshResult = Result<Vec<MarketRecord>, RefreshError>;

/// Outcome of a completed refresh, shared with every coalesced caller.
#[derive(Debug, Clone)]
struct Fetched {
    records: Vec<MarketRecord>,
    stored_at: Timestamp,
    quality: QualityScore,
}

/// Where the durable step of a read looks.
#[derive(Clone, Copy)]
enum DurableLookup<'a> {
    Key,
    Scope(&'a DurableScope),
}

/// Result of writing one batch to both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteOutcome {
    local: Option<Timestamp>,
    durable: bool,
}

impl WriteOutcome {
    fn any(&self) -> bool {
        self.local.is_some() || self.durable
    }
}

async fn write_through<L: LocalTier, D: DurableTier>(
    local: &L,
    durable: &D,
    key: &CacheKey,
    records: &[MarketRecord],
    quality: Option<&QualityScore>,
    extent: Option<&DurableScope>,
) -> WriteOutcome {
    let (local_res, durable_res) = tokio::join!(
        local.put(key, records, quality),
        durable.put(key, records, extent)
    );

    let local_at = match local_res {
        Ok(at) => Some(at),
        Err(e) => {
            warn!(cache_key = %key, tier = ?Tier::Local, error = %e, "local write failed");
            None
        }
    };
    let durable_ok = match durable_res {
        Ok(rows) => {
            debug!(cache_key = %key, tier = ?Tier::Durable, rows, "durable write complete");
            true
        }
        Err(e) => {
            warn!(cache_key = %key, tier = ?Tier::Durable, error = %e, "durable write failed");
            false
        }
    };

    let outcome = WriteOutcome {
        local: local_at,
        durable: durable_ok,
    };
    if !outcome.any() {
        error!(cache_key = %key, "write failed on both tiers");
    }
    outcome
}

fn log_quality(scorer: &QualityScorer, key: &CacheKey, quality: &QualityScore) {
    if let Some(warning) = scorer.warning_for(&key.render(), quality) {
        warn!(
            cache_key = %key,
            score = warning.score,
            issues = warning.issue_count,
            "{}",
            warning
        );
    }
}

/// Two-tier cache in front of a caller-supplied refresh.
pub struct CacheOrchestrator<L, D>
where
    L: LocalTier,
    D: DurableTier,
{
    local: Arc<L>,
    durable: Arc<D>,
    scorer: QualityScorer,
    clock: SharedClock,
    policy: CachePolicy,
    flights: SingleFlight<String, Result<Fetched, RefreshError>>,
}

impl<L, D> CacheOrchestrator<L, D>
where
    L: LocalTier,
    D: DurableTier,
{
    pub fn new(
        local: Arc<L>,
        durable: Arc<D>,
        scorer: QualityScorer,
        clock: SharedClock,
        policy: CachePolicy,
    ) -> Self {
        Self {
            local,
            durable,
            scorer,
            clock,
            policy,
            flights: SingleFlight::new(),
        }
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub fn durable(&self) -> &Arc<D> {
        &self.durable
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn scorer(&self) -> &QualityScorer {
        &self.scorer
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Keys with a refresh currently in flight.
    pub fn refreshes_in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    pub async fn local_stats(&self) -> QuarryResult<CacheStats> {
        self.local.stats().await
    }

    /// Read `key`, refreshing through `refresh` when neither tier has
    /// fresh data.
    pub async fn get<F, Fut>(&self, key: &CacheKey, ttl: Duration, refresh: F) -> CacheResponse
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshResult> + Send + 'static,
    {
        self.lookup(key, ttl, DurableLookup::Key, refresh).await
    }

    /// Like [`get`](Self::get), but the durable step answers from any key
    /// whose stored extent covers `scope`. A refresh records `scope` as the
    /// extent of `key`.
    pub async fn get_scoped<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        scope: &DurableScope,
        refresh: F,
    ) -> CacheResponse
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshResult> + Send + 'static,
    {
        self.lookup(key, ttl, DurableLookup::Scope(scope), refresh)
            .await
    }

    /// Rows the durable tier holds for `scope` under a covering extent,
    /// regardless of age.
    pub async fn read_durable(&self, scope: &DurableScope) -> CacheResponse {
        match self.durable.query(scope, Freshness::IgnoreTtl).await {
            Ok(Some(batch)) if !batch.is_empty() => CacheResponse::fresh(Tier::Durable, batch),
            Ok(_) => CacheResponse::unavailable(),
            Err(e) => {
                warn!(entity_id = %scope.entity_id, tier = ?Tier::Durable, error = %e, "durable scope read failed");
                CacheResponse::unavailable()
            }
        }
    }

    async fn lookup<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        durable_lookup: DurableLookup<'_>,
        refresh: F,
    ) -> CacheResponse
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshResult> + Send + 'static,
    {
        match self.local.get(key, Freshness::within(ttl)).await {
            Ok(Some(batch)) => {
                debug!(cache_key = %key, tier = ?Tier::Local, "cache hit");
                return CacheResponse::fresh(Tier::Local, batch);
            }
            Ok(None) => debug!(cache_key = %key, tier = ?Tier::Local, "cache miss"),
            Err(e) => warn!(cache_key = %key, tier = ?Tier::Local, error = %e, "local read failed"),
        }

        let durable_freshness = Freshness::within(self.policy.durable_ttl);
        let durable_read = match durable_lookup {
            DurableLookup::Key => self.durable.get(key, durable_freshness).await,
            DurableLookup::Scope(scope) => self.durable.query(scope, durable_freshness).await,
        };
        match durable_read {
            Ok(Some(batch)) if !batch.is_empty() => {
                debug!(cache_key = %key, tier = ?Tier::Durable, records = batch.records.len(), "cache hit");
                self.backfill(key, &batch).await;
                return CacheResponse::fresh(Tier::Durable, batch);
            }
            Ok(_) => debug!(cache_key = %key, tier = ?Tier::Durable, "cache miss"),
            Err(e) => {
                warn!(cache_key = %key, tier = ?Tier::Durable, error = %e, "durable read failed")
            }
        }

        let extent = match durable_lookup {
            DurableLookup::Key => None,
            DurableLookup::Scope(scope) => Some(scope.clone()),
        };
        match self.refresh(key, extent, refresh).await {
            Ok(fetched) => CacheResponse {
                records: fetched.records,
                tier: Some(Tier::Source),
                status: ReadStatus::Fresh,
                stored_at: Some(fetched.stored_at),
                quality: Some(fetched.quality),
            },
            Err(e) => {
                warn!(cache_key = %key, error = %e, "refresh failed, falling back to stale data");
                self.stale_fallback(key).await
            }
        }
    }

    async fn backfill(&self, key: &CacheKey, batch: &CachedBatch) {
        if let Err(e) = self
            .local
            .put(key, &batch.records, batch.quality.as_ref())
            .await
        {
            warn!(cache_key = %key, tier = ?Tier::Local, error = %e, "backfill failed");
        }
    }

    async fn stale_fallback(&self, key: &CacheKey) -> CacheResponse {
        match self.local.get(key, Freshness::IgnoreTtl).await {
            Ok(Some(batch)) => {
                warn!(
                    cache_key = %key,
                    tier = ?Tier::Local,
                    stored_at = %batch.updated_at,
                    "serving stale data"
                );
                CacheResponse::stale(batch)
            }
            Ok(None) => {
                warn!(cache_key = %key, "no data available");
                CacheResponse::unavailable()
            }
            Err(e) => {
                warn!(cache_key = %key, tier = ?Tier::Local, error = %e, "stale read failed");
                CacheResponse::unavailable()
            }
        }
    }

    /// Run `refresh` at most once per key at a time. Only the leading
    /// caller's closure is invoked; it scores and writes through, and
    /// coalesced callers receive the same outcome.
    async fn refresh<F, Fut>(
        &self,
        key: &CacheKey,
        extent: Option<DurableScope>,
        refresh: F,
    ) -> Result<Fetched, RefreshError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshResult> + Send + 'static,
    {
        let local = self.local.clone();
        let durable = self.durable.clone();
        let scorer = self.scorer.clone();
        let clock = self.clock.clone();
        let max_age = self.policy.quality_max_age;
        let owned_key = key.clone();

        let (outcome, led) = self
            .flights
            .run(key.render(), move || {
                let fetch = refresh();
                async move {
                    let records = fetch.await?;
                    if records.is_empty() {
                        return Err(RefreshError::Empty);
                    }

                    let quality = scorer.score_batch(&records, clock.now(), max_age);
                    log_quality(&scorer, &owned_key, &quality);

                    let written = write_through(
                        local.as_ref(),
                        durable.as_ref(),
                        &owned_key,
                        &records,
                        Some(&quality),
                        extent.as_ref(),
                    )
                    .await;

                    Ok(Fetched {
                        stored_at: written.local.unwrap_or_else(|| clock.now()),
                        records,
                        quality,
                    })
                }
            })
            .await;

        if !led {
            debug!(cache_key = %key, "joined in-flight refresh");
        }
        outcome
    }

    /// Score and write `records` to both tiers. True if at least one tier
    /// accepted the write.
    pub async fn store(&self, key: &CacheKey, records: &[MarketRecord]) -> bool {
        if records.is_empty() {
            debug!(cache_key = %key, "refusing to store empty batch");
            return false;
        }
        let quality = self
            .scorer
            .score_batch(records, self.clock.now(), self.policy.quality_max_age);
        log_quality(&self.scorer, key, &quality);

        write_through(
            self.local.as_ref(),
            self.durable.as_ref(),
            key,
            records,
            Some(&quality),
            None,
        )
        .await
        .any()
    }

    /// Delete `key` from both tiers. True only if both deletes succeeded.
    pub async fn clear(&self, key: &CacheKey) -> bool {
        let (local_res, durable_res) =
            tokio::join!(self.local.delete(key), self.durable.delete(key));

        let mut cleared = true;
        if let Err(e) = local_res {
            warn!(cache_key = %key, tier = ?Tier::Local, error = %e, "local delete failed");
            cleared = false;
        }
        match durable_res {
            Ok(rows) => debug!(cache_key = %key, tier = ?Tier::Durable, rows, "cleared"),
            Err(e) => {
                warn!(cache_key = %key, tier = ?Tier::Durable, error = %e, "durable delete failed");
                cleared = false;
            }
        }
        cleared
    }

    /// Ping both tiers.
    pub async fn health(&self) -> Vec<HealthCheck> {
        let local_start = Instant::now();
        let local_res = self.local.ping().await;
        let local_ms = local_start.elapsed().as_millis() as i64;

        let durable_start = Instant::now();
        let durable_res = self.durable.ping().await;
        let durable_ms = durable_start.elapsed().as_millis() as i64;

        vec![
            tier_check(self.local.name(), Tier::Local, local_res, local_ms),
            tier_check(self.durable.name(), Tier::Durable, durable_res, durable_ms),
        ]
    }
}

fn tier_check(name: &str, tier: Tier, result: QuarryResult<()>, ms: i64) -> HealthCheck {
    let check = match result {
        Ok(()) => HealthCheck::healthy(name),
        Err(e) => {
            warn!(tier = ?tier, error = %e, "health check failed");
            HealthCheck::unhealthy(name, e.to_string())
        }
    };
    check.for_tier(tier).with_response_time(ms)
}
