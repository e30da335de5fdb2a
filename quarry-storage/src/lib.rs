//! QUARRY Storage - Tiered cache, coverage tracking and orchestration
//!
//! The local tier (LMDB) answers hot reads, the durable tier (Postgres
//! JSONB) keeps every record and serves date-range queries, and the
//! [`CacheOrchestrator`] sits in front of both with write-through and
//! stale fallback. [`CoverageTracker`] decides when a full or delta
//! refresh is due.

pub mod cache;
pub mod coverage;
pub mod orchestrator;
pub mod single_flight;

pub use cache::{
    create_pool, CacheResponse, CacheStats, CachedBatch, DurableScope, DurableTier, Freshness,
    LmdbLocalTier, LmdbTierError, LocalTier, MemoryDocumentStore, MemoryLocalTier,
    PgDocumentStore,
};
pub use coverage::{CoverageStore, CoverageTracker, MemoryCoverageStore, PgCoverageStore};
pub use orchestrator::{CacheOrchestrator, RefreshResult};
pub use single_flight::SingleFlight;
