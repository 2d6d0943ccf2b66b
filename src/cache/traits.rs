//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;

/// Trait for entities that can be cached individually.
///
/// The cache key doubles as the join key for optimistic reconciliation and
/// realtime merging, so it must be unique and stable per entity.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity
  fn cache_key(&self) -> String;
}

/// Result from a cache-backed fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<Instant>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Instant, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for a failed refresh served from cache.
  pub fn offline(data: T, cached_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its TTL, a revalidation is due
  CacheStale,
  /// Network refresh failed, serving cached data
  Offline,
}
