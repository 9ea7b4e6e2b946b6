//! Time-boxed, memory-resident cache of query snapshots.
//!
//! This module provides:
//! - Entries keyed by the literal `endpoint:query` string
//! - A TTL per entry chosen by a query-text classifier (critical / broad / normal)
//! - Lazy eviction: expired entries are invisible to reads and swept on writes
//! - One shared upstream fetch per cold key, however many callers miss on it

mod layer;
mod result;
mod tier;

pub use layer::{cache_key, CacheEntry, QueryCache};
pub use result::{CacheEntryInfo, CacheResult, CacheSource, CacheStats};
pub use tier::{QueryClassifier, TtlTier, TtlTiers};
