//! Strategy-driven HTTP response cache.
//!
//! This module provides:
//! - Named caches of request -> response pairs with freshness bookkeeping
//! - Five serving strategies (cache-first, network-first,
//!   stale-while-revalidate, network-only, cache-only)
//! - Timeout-bounded network fallback and FIFO eviction
//! - Basic offline mode (serve cached responses when the network fails)

mod manager;
mod storage;
mod strategy;
mod traits;

pub use manager::CacheManager;
pub use storage::{CacheStore, NoopStore, SqliteStore};
pub use strategy::{CacheStrategy, CacheStrategyConfig, UrlPattern, DEFAULT_NETWORK_TIMEOUT};
pub use traits::{CacheEntry, CacheResult, CacheSource, CacheStats};

pub(crate) use storage::{format_datetime, parse_datetime};
