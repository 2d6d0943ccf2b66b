//! In-memory cache store for query results and entities.
//!
//! This module provides the stale-while-revalidate store the query layer
//! reads from:
//! - Entries are JSON payloads stamped with their insertion time
//! - Entries older than the TTL are flagged stale but are still served
//! - Entries only disappear through explicit invalidation
//! - Every write is announced on a broadcast channel so open queries can
//!   pick up realtime and optimistic changes

mod store;
mod traits;

pub use store::{CacheEntry, CacheEvent, CacheEventKind, CacheStore};
pub use traits::{CacheResult, CacheSource, Cacheable};
