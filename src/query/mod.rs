//! Query hooks over the shared cache.
//!
//! Inspired by TanStack Query / SWR. A `Query<T>` is one consumer's view of a
//! cache key: it reads through the `QueryClient`, tracks loading and
//! validating state, and picks up writes to its key made by anyone else
//! (realtime merges, optimistic mutations, other hooks).
//!
//! # Example
//!
//! ```ignore
//! let mut query = properties_query(&client, &api);
//! query.start();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, re-render from query.snapshot()
//! }
//! ```

mod client;
mod infinite;
mod keys;

pub use client::{QueryClient, SharedFetch};
pub(crate) use client::spawn_logged;
pub use infinite::InfiniteQuery;
pub use keys::QueryKey;

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::backend::types::{ListingCategory, Property};
use crate::cache::{CacheEvent, CacheEventKind};
use crate::error::{Result, SyncError};
use crate::properties::PropertyApi;

/// Coarse lifecycle of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Query has not been started
  Idle,
  /// First load, no data yet
  Loading,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed; previous data (if any) is still available
  Error,
}

/// Point-in-time view of a query for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
  pub data: Option<T>,
  pub status: QueryStatus,
  /// True only while there is no data at all
  pub is_loading: bool,
  /// True while any fetch for this hook is in flight
  pub is_validating: bool,
  pub error: Option<SyncError>,
}

type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

enum Message<T> {
  /// Cached value served while the network request runs
  Cached(T),
  /// Fetch finished; `None` means the cached value was fresh
  Settled(Result<Option<T>>),
}

pub struct Query<T> {
  key: QueryKey,
  client: Arc<QueryClient>,
  fetcher: FetcherFn<T>,
  status: QueryStatus,
  data: Option<T>,
  error: Option<SyncError>,
  receiver: Option<mpsc::UnboundedReceiver<Message<T>>>,
  events: broadcast::Receiver<CacheEvent>,
}

impl<T> Query<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Create a hook for `key`. Nothing is fetched until `start()`.
  pub fn new<F, Fut>(client: Arc<QueryClient>, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let events = client.cache().subscribe();
    Self {
      key,
      client,
      fetcher: Arc::new(move || fetcher().boxed()),
      status: QueryStatus::Idle,
      data: None,
      error: None,
      receiver: None,
      events,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.error.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.data.is_none() && self.is_validating()
  }

  pub fn is_validating(&self) -> bool {
    self.receiver.is_some()
  }

  pub fn snapshot(&self) -> QuerySnapshot<T> {
    QuerySnapshot {
      data: self.data.clone(),
      status: self.status,
      is_loading: self.is_loading(),
      is_validating: self.is_validating(),
      error: self.error.clone(),
    }
  }

  /// Read through the cache, revalidating if the entry is stale or missing.
  ///
  /// This is a no-op while a fetch for this hook is already running.
  pub fn start(&mut self) {
    if self.receiver.is_none() {
      self.spawn_fetch(false);
    }
  }

  /// Revalidate regardless of cache freshness.
  pub fn refresh(&mut self) {
    self.spawn_fetch(true);
  }

  fn spawn_fetch(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if self.data.is_none() {
      self.status = QueryStatus::Loading;
    }

    let client = self.client.clone();
    let fetcher = self.fetcher.clone();
    let cache_key = self.key.cache_key();
    debug!(key = %cache_key, force, "Query fetch");

    tokio::spawn(async move {
      if !force {
        match client.cache().get::<T>(&cache_key) {
          Ok(Some(entry)) => {
            let fresh = !entry.is_stale;
            // Receiver may have been dropped
            let _ = tx.send(Message::Cached(entry.data));
            if fresh {
              let _ = tx.send(Message::Settled(Ok(None)));
              return;
            }
          }
          Ok(None) => {}
          Err(e) => warn!(key = %cache_key, error = %e, "Unreadable cache entry, refetching"),
        }
      }

      let result = client
        .revalidate(&cache_key, move || fetcher(), force)
        .await
        .and_then(|payload| Ok(Some(serde_json::from_value::<T>(payload)?)));
      let _ = tx.send(Message::Settled(result));
    });
  }

  fn apply(&mut self, message: Message<T>) {
    match message {
      Message::Cached(data) => {
        self.data = Some(data);
        self.status = QueryStatus::Success;
      }
      Message::Settled(Ok(fetched)) => {
        if let Some(data) = fetched {
          self.data = Some(data);
        }
        self.status = QueryStatus::Success;
        self.error = None;
        self.receiver = None;
      }
      Message::Settled(Err(e)) => {
        if self.data.is_some() {
          warn!(key = %self.key.cache_key(), error = %e, "Refresh failed, keeping previous data");
        } else {
          warn!(key = %self.key.cache_key(), error = %e, "Query failed");
        }
        self.status = QueryStatus::Error;
        self.error = Some(e);
        self.receiver = None;
      }
    }
  }

  /// Re-read our key after someone else wrote it.
  fn reload_from_cache(&mut self) -> bool {
    match self.client.cache().get::<T>(&self.key.cache_key()) {
      Ok(Some(entry)) => {
        self.data = Some(entry.data);
        if self.status != QueryStatus::Error {
          self.status = QueryStatus::Success;
        }
        true
      }
      Ok(None) => false,
      Err(e) => {
        warn!(key = %self.key.cache_key(), error = %e, "Unreadable cache entry");
        false
      }
    }
  }

  /// Drain cache events; returns true if our key changed.
  fn drain_events(&mut self) -> bool {
    let key = self.key.cache_key();
    let mut set = false;
    let mut invalidated = false;
    loop {
      match self.events.try_recv() {
        Ok(event) if event.key == key => match event.kind {
          CacheEventKind::Set => set = true,
          CacheEventKind::Invalidated => invalidated = true,
        },
        Ok(_) => {}
        Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
          debug!(key = %key, skipped, "Cache events lagged, re-reading");
          set = true;
        }
        Err(_) => break,
      }
    }

    let mut changed = false;
    if set {
      changed |= self.reload_from_cache();
    }
    // An invalidated key is refetched if this hook has been started.
    if invalidated && self.status != QueryStatus::Idle && self.receiver.is_none() {
      self.spawn_fetch(false);
      changed = true;
    }
    changed
  }

  /// Poll for fetch results and cache writes without blocking.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(message) => {
          self.apply(message);
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => break,
        Err(mpsc::error::TryRecvError::Disconnected) => {
          self.apply(Message::Settled(Err(SyncError::Cancelled(
            "query task ended without a result".into(),
          ))));
          changed = true;
        }
      }
    }
    changed | self.drain_events()
  }

  /// Wait for the in-flight fetch (if any) to settle.
  pub async fn wait(&mut self) -> QuerySnapshot<T> {
    while let Some(receiver) = &mut self.receiver {
      let message = receiver.recv().await.unwrap_or_else(|| {
        Message::Settled(Err(SyncError::Cancelled(
          "query task ended without a result".into(),
        )))
      });
      self.apply(message);
    }
    self.drain_events();
    self.snapshot()
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("status", &self.status)
      .field("data", &self.data)
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}

/// Hook for one listing by id. `None` when the row does not exist.
pub fn property_query(client: &Arc<QueryClient>, api: &PropertyApi, id: i64) -> Query<Option<Property>> {
  let api = api.clone();
  Query::new(client.clone(), QueryKey::Property(id), move || {
    let api = api.clone();
    async move { api.fetch_by_id(id).await }
  })
}

/// Hook for the full collection, newest first.
pub fn properties_query(client: &Arc<QueryClient>, api: &PropertyApi) -> Query<Vec<Property>> {
  let api = api.clone();
  Query::new(client.clone(), QueryKey::Properties, move || {
    let api = api.clone();
    async move { api.fetch_all().await }
  })
}

pub fn category_query(
  client: &Arc<QueryClient>,
  api: &PropertyApi,
  category: ListingCategory,
) -> Query<Vec<Property>> {
  let api = api.clone();
  Query::new(client.clone(), QueryKey::Category(category), move || {
    let api = api.clone();
    async move { api.fetch_by_category(category).await }
  })
}
