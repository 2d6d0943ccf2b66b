//! Shared query client: cache reads, deduplicated fetches, revalidation.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::keys::QueryKey;
use crate::cache::{CacheResult, CacheStore};
use crate::error::{Result, SyncError};

/// A fetch that any number of callers can await.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

struct InFlight {
  started_at: Instant,
  fetch: SharedFetch,
}

/// Owns the cache and the per-key in-flight fetch table.
///
/// Fetches are spawned, so they run to completion and write the cache even
/// when every caller has gone away. When two fetches for one key overlap,
/// whichever resolves last wins.
pub struct QueryClient {
  cache: Arc<CacheStore>,
  dedup_window: Duration,
  inflight: Mutex<HashMap<String, InFlight>>,
}

impl QueryClient {
  pub fn new(cache: Arc<CacheStore>, dedup_window: Duration) -> Self {
    Self {
      cache,
      dedup_window,
      inflight: Mutex::new(HashMap::new()),
    }
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  fn inflight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
    self.inflight.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Start a fetch for `key`, or join one that is still running. A fetch
  /// that already succeeded inside the dedup window is reused unless
  /// `force` is set or its cache entry has since been invalidated; a failed
  /// one never is.
  pub fn revalidate<T, F, Fut>(&self, key: &str, fetcher: F, force: bool) -> SharedFetch
  where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let now = Instant::now();
    let mut inflight = self.inflight();

    if let Some(existing) = inflight.get(key) {
      let reusable = match existing.fetch.peek() {
        None => true,
        Some(Ok(_)) => {
          !force
            && now.duration_since(existing.started_at) < self.dedup_window
            && self.cache.get_raw(key).is_some()
        }
        Some(Err(_)) => false,
      };
      if reusable {
        debug!(key, "Joining existing fetch");
        return existing.fetch.clone();
      }
    }

    debug!(key, force, "Starting fetch");
    let future = fetcher();
    let cache = Arc::clone(&self.cache);
    let cache_key = key.to_string();
    let handle = tokio::spawn(async move {
      let value = future.await?;
      let payload = serde_json::to_value(&value)?;
      cache.set_raw(&cache_key, payload.clone());
      Ok::<Value, SyncError>(payload)
    });

    let fetch: SharedFetch = async move { handle.await? }.boxed().shared();
    inflight.insert(
      key.to_string(),
      InFlight {
        started_at: now,
        fetch: fetch.clone(),
      },
    );
    fetch
  }

  /// Stale-while-revalidate read.
  ///
  /// A cached value is returned immediately, fresh or stale; a stale one
  /// also schedules a background refresh. Only a miss waits on the network.
  pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let cache_key = key.cache_key();

    if let Some(entry) = self.cache.get::<T>(&cache_key)? {
      if entry.is_stale {
        let refresh = self.revalidate(&cache_key, fetcher, false);
        spawn_logged(cache_key, refresh);
      }
      return Ok(CacheResult::from_cache(
        entry.data,
        entry.inserted_at,
        entry.is_stale,
      ));
    }

    let payload = self.revalidate(&cache_key, fetcher, false).await?;
    Ok(CacheResult::from_network(serde_json::from_value(payload)?))
  }

  /// Revalidate regardless of freshness and wait for the result.
  ///
  /// When the refresh fails but cached data exists, the cached data is
  /// returned flagged `Offline` and the error is logged.
  pub async fn refetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let cache_key = key.cache_key();

    match self.revalidate(&cache_key, fetcher, true).await {
      Ok(payload) => Ok(CacheResult::from_network(serde_json::from_value(payload)?)),
      Err(e) => match self.cache.get::<T>(&cache_key)? {
        Some(entry) => {
          warn!(key = %cache_key, error = %e, "Refresh failed, serving cached data");
          Ok(CacheResult::offline(entry.data, entry.inserted_at))
        }
        None => Err(e),
      },
    }
  }

  /// Drop the cached value for `key` so the next read refetches.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    let cache_key = key.cache_key();
    self.inflight().remove(&cache_key);
    self.cache.invalidate(&cache_key)
  }

  /// Drop every cached value whose key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    self.inflight().retain(|key, _| !key.starts_with(prefix));
    self.cache.invalidate_prefix(prefix)
  }
}

/// Drive a background refresh to completion, logging a failure.
pub(crate) fn spawn_logged(key: String, fetch: SharedFetch) {
  tokio::spawn(async move {
    if let Err(e) = fetch.await {
      warn!(key = %key, error = %e, "Background refresh failed");
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn client(ttl: Duration) -> QueryClient {
    QueryClient::new(Arc::new(CacheStore::new(ttl)), Duration::from_secs(5))
  }

  fn counting_fetcher(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Vec<i64>>> {
    let calls = calls.clone();
    move || {
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst) as i64;
        tokio::time::sleep(delay).await;
        Ok(vec![n])
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_miss_fetches_and_fills_cache() {
    let client = client(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = client
      .fetch(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, vec![0]);

    let again: CacheResult<Vec<i64>> = client
      .fetch(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(again.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_callers_share_one_fetch() {
    let client = Arc::new(client(Duration::from_secs(60)));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
      let client = client.clone();
      let fetcher = counting_fetcher(&calls, Duration::from_millis(100));
      handles.push(tokio::spawn(async move {
        client.fetch(&QueryKey::Property(1), fetcher).await
      }));
    }
    for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap().data, vec![0]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_served_then_refreshed_in_background() {
    let client = client(Duration::from_secs(10));
    let calls = Arc::new(AtomicUsize::new(0));
    client
      .fetch::<Vec<i64>, _, _>(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;

    let stale: CacheResult<Vec<i64>> = client
      .fetch(&QueryKey::Properties, counting_fetcher(&calls, Duration::from_millis(50)))
      .await
      .unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(stale.data, vec![0]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let entry = client.cache().get::<Vec<i64>>("properties").unwrap().unwrap();
    assert_eq!(entry.data, vec![1]);
    assert!(!entry.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_forced_refetch_bypasses_fresh_cache() {
    let client = client(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    client
      .fetch::<Vec<i64>, _, _>(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    let refreshed: CacheResult<Vec<i64>> = client
      .refetch(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(refreshed.data, vec![1]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refetch_keeps_cached_data() {
    let client = client(Duration::from_secs(60));
    client.cache().set("properties", &vec![7i64]).unwrap();

    let result: CacheResult<Vec<i64>> = client
      .refetch(&QueryKey::Properties, || async {
        Err::<Vec<i64>, _>(SyncError::Network("offline".into()))
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, vec![7]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_fetch_without_cache_propagates() {
    let client = client(Duration::from_secs(60));

    let result = client
      .fetch::<Vec<i64>, _, _>(&QueryKey::Properties, || async {
        Err(SyncError::Network("offline".into()))
      })
      .await;
    assert_eq!(result.unwrap_err(), SyncError::Network("offline".into()));
    assert!(client.cache().get_raw("properties").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_completed_fetch_is_reused_inside_dedup_window_only() {
    let client = client(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    client
      .revalidate("k", counting_fetcher(&calls, Duration::ZERO), false)
      .await
      .unwrap();
    client
      .revalidate("k", counting_fetcher(&calls, Duration::ZERO), false)
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    client
      .revalidate("k", counting_fetcher(&calls, Duration::ZERO), false)
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_inside_dedup_window_refetches() {
    let client = client(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    client
      .fetch::<Vec<i64>, _, _>(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    client.invalidate(&QueryKey::Properties);
    tokio::time::advance(Duration::from_secs(1)).await;

    let result: CacheResult<Vec<i64>> = client
      .fetch(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(result.data, vec![1]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(client.cache().get_raw("properties").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cache_level_invalidation_is_not_masked_by_window() {
    let client = client(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    client
      .revalidate("k", counting_fetcher(&calls, Duration::ZERO), false)
      .await
      .unwrap();

    client.cache().invalidate("k");
    let payload = client
      .revalidate("k", counting_fetcher(&calls, Duration::ZERO), false)
      .await
      .unwrap();
    assert_eq!(payload, serde_json::json!([1]));
    assert_eq!(client.cache().get_raw("k").unwrap().data, serde_json::json!([1]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_fetch_is_not_replayed() {
    let client = client(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let first = client
      .fetch::<Vec<i64>, _, _>(&QueryKey::Properties, || async {
        Err(SyncError::Network("blip".into()))
      })
      .await;
    assert!(first.is_err());

    tokio::time::advance(Duration::from_secs(2)).await;
    let second: CacheResult<Vec<i64>> = client
      .fetch(&QueryKey::Properties, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(second.data, vec![0]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_prefix_clears_matching_views() {
    let client = client(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let page = QueryKey::Page { page: 0, size: 10 };
    client
      .fetch::<Vec<i64>, _, _>(&page, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    client.cache().set("properties", &vec![9i64]).unwrap();

    assert_eq!(client.invalidate_prefix(QueryKey::PAGE_PREFIX), 1);
    assert!(client.cache().get_raw(&page.cache_key()).is_none());
    assert!(client.cache().get_raw("properties").is_some());

    let refetched: CacheResult<Vec<i64>> = client
      .fetch(&page, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(refetched.data, vec![1]);
  }
}
