//! Platform lifecycle.
//!
//! [`MarketDataPlatform`] owns every long-lived component: both tiers, the
//! coverage tracker, the orchestrator and the services. Nothing is global;
//! build one at startup and call [`shutdown`](MarketDataPlatform::shutdown)
//! on exit.

use std::sync::Arc;

use quarry_core::{
    overall_status, HealthCheck, HealthStatus, QualityScorer, QualityWeights, QuarryConfig,
    QuarryResult, SharedClock, SystemClock,
};
use quarry_storage::{
    create_pool, CacheOrchestrator, CoverageStore, CoverageTracker, DurableTier, LmdbLocalTier,
    LocalTier, MemoryCoverageStore, MemoryDocumentStore, MemoryLocalTier, PgCoverageStore,
    PgDocumentStore,
};
use tracing::{info, warn};

use crate::provider::SharedProvider;
use crate::services::{
    EconomicDataService, FundamentalsService, NewsService, StockDataService,
};

/// LMDB + Postgres.
pub type ProductionPlatform = MarketDataPlatform<LmdbLocalTier, PgDocumentStore, PgCoverageStore>;

/// In-process doubles for every store.
pub type InMemoryPlatform =
    MarketDataPlatform<MemoryLocalTier, MemoryDocumentStore, MemoryCoverageStore>;

/// Owned graph of tiers, trackers and services.
pub struct MarketDataPlatform<L, D, S>
where
    L: LocalTier,
    D: DurableTier,
    S: CoverageStore,
{
    config: QuarryConfig,
    orchestrator: Arc<CacheOrchestrator<L, D>>,
    coverage: Arc<CoverageTracker<S>>,
    stocks: StockDataService<L, D, S>,
    fundamentals: FundamentalsService<L, D>,
    economic: EconomicDataService<L, D>,
    news: NewsService<L, D>,
}

impl ProductionPlatform {
    /// Open the LMDB environment and Postgres pool, apply both schemas and
    /// wire the services.
    pub async fn open(config: QuarryConfig, provider: SharedProvider) -> QuarryResult<Self> {
        config.validate()?;
        let clock = SystemClock::shared();

        let local = LmdbLocalTier::new(&config.local.path, config.local.max_size_mb, clock.clone())?;
        let pool = create_pool(&config.durable)?;
        let durable = PgDocumentStore::new(pool.clone(), clock.clone());
        durable.ensure_schema().await?;
        let coverage = PgCoverageStore::new(pool);
        coverage.ensure_schema().await?;

        info!(
            lmdb_path = %config.local.path.display(),
            db_host = %config.durable.host,
            db_name = %config.durable.dbname,
            "market data platform opened"
        );
        Ok(Self::assemble(config, local, durable, coverage, provider, clock))
    }
}

impl InMemoryPlatform {
    pub fn in_memory(config: QuarryConfig, provider: SharedProvider, clock: SharedClock) -> Self {
        Self::assemble(
            config,
            MemoryLocalTier::new(clock.clone()),
            MemoryDocumentStore::new(clock.clone()),
            MemoryCoverageStore::new(),
            provider,
            clock,
        )
    }
}

impl<L, D, S> MarketDataPlatform<L, D, S>
where
    L: LocalTier,
    D: DurableTier,
    S: CoverageStore,
{
    /// Wire already-open stores into a platform.
    pub fn assemble(
        config: QuarryConfig,
        local: L,
        durable: D,
        coverage_store: S,
        provider: SharedProvider,
        clock: SharedClock,
    ) -> Self {
        let scorer = QualityScorer::new(
            QualityWeights::default(),
            config.cache.quality_warning_threshold,
        );

        let orchestrator = Arc::new(CacheOrchestrator::new(
            Arc::new(local),
            Arc::new(durable),
            scorer.clone(),
            clock.clone(),
            config.cache.clone(),
        ));
        let coverage = Arc::new(
            CoverageTracker::new(
                Arc::new(coverage_store),
                config.refresh.clone(),
                scorer,
                clock,
            )
            .with_source(provider.name())
            .with_quality_max_age(config.cache.quality_max_age),
        );

        Self {
            stocks: StockDataService::new(orchestrator.clone(), coverage.clone(), provider.clone()),
            fundamentals: FundamentalsService::new(orchestrator.clone(), provider.clone()),
            economic: EconomicDataService::new(orchestrator.clone(), provider.clone()),
            news: NewsService::new(orchestrator.clone(), provider),
            orchestrator,
            coverage,
            config,
        }
    }

    pub fn config(&self) -> &QuarryConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<CacheOrchestrator<L, D>> {
        &self.orchestrator
    }

    pub fn coverage(&self) -> &Arc<CoverageTracker<S>> {
        &self.coverage
    }

    pub fn stocks(&self) -> &StockDataService<L, D, S> {
        &self.stocks
    }

    pub fn fundamentals(&self) -> &FundamentalsService<L, D> {
        &self.fundamentals
    }

    pub fn economic(&self) -> &EconomicDataService<L, D> {
        &self.economic
    }

    pub fn news(&self) -> &NewsService<L, D> {
        &self.news
    }

    /// Per-tier checks and their overall status.
    pub async fn health(&self) -> (HealthStatus, Vec<HealthCheck>) {
        let checks = self.orchestrator.health().await;
        (overall_status(&checks), checks)
    }

    /// Flush the local tier and release durable connections.
    pub async fn shutdown(self) {
        if let Err(e) = self.orchestrator.local().flush().await {
            warn!(error = %e, "local tier flush failed during shutdown");
        }
        self.orchestrator.durable().close().await;
        info!("market data platform shut down");
    }
}
