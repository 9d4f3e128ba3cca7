//! # Broker Model Cache
//!
//! Time-bounded map from model id to [`broker_provider::ModelDescriptor`].
//!
//! - Staleness is computed at read time from `fetched_at + ttl`; there is no
//!   background timer.
//! - A miss or an expired entry triggers one discovery call. When that call
//!   fails, a previous snapshot is still served, flagged `stale`.
//! - `refresh_all` ignores the TTL and replaces every entry.

mod cache;
mod error;

pub use cache::{CacheEntry, CachedDescriptor, ModelContextCache, DEFAULT_CACHE_TTL};
pub use error::{CacheError, Result};
