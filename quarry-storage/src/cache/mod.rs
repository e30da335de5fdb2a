//! Storage tiers with explicit freshness contracts.
//!
//! Two physical tiers sit behind traits:
//!
//! - [`LocalTier`]: a key/value table holding one record batch per cache
//!   key (LMDB in production, a `HashMap` in tests)
//! - [`DurableTier`]: a per-record document store queryable by date range
//!   (Postgres JSONB in production, a `BTreeMap` in tests)
//!
//! Callers state their staleness tolerance with [`Freshness`]. A deliberate
//! stale read is `Freshness::IgnoreTtl`, never a silent fallback inside a
//! tier.
//!
//! # Example
//!
//! ```ignore
//! let tier = LmdbLocalTier::new(&config.local.path, config.local.max_size_mb, clock)?;
//! let batch = tier
//!     .get(&CacheKey::new("AAPL", "daily"), Freshness::within(Duration::from_secs(6 * 3600)))
//!     .await?;
//! ```

pub mod document_store;
pub mod freshness;
pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use document_store::{create_pool, PgDocumentStore};
pub use freshness::{CacheResponse, CachedBatch, Freshness};
pub use lmdb_backend::{LmdbLocalTier, LmdbTierError};
pub use memory::{MemoryDocumentStore, MemoryLocalTier};
pub use traits::{CacheStats, DurableScope, DurableTier, LocalTier};
