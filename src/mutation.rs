//! Optimistic mutations against cached collections.
//!
//! The cached collection is changed before the server call is made, then
//! either reconciled with the server's answer or restored from a snapshot.
//! A failed mutation is rolled back before its error is returned.

use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::types::Property;
use crate::cache::{CacheStore, Cacheable};
use crate::error::Result;
use crate::properties::PropertyApi;
use crate::query::{QueryClient, QueryKey};

/// Snapshot, apply `optimistic`, await `server`, then `reconcile` or roll
/// back.
///
/// Reconciliation starts from whatever is cached when the server answers,
/// so writes that landed in between (realtime changes, other mutations) are
/// kept. A missing key is treated as `C::default()`.
pub async fn mutate_optimistic<C, R, Fut>(
  cache: &CacheStore,
  key: &str,
  optimistic: impl FnOnce(&mut C),
  server: Fut,
  reconcile: impl FnOnce(&mut C, &R),
) -> Result<R>
where
  C: Serialize + DeserializeOwned + Default,
  Fut: Future<Output = Result<R>>,
{
  let snapshot = cache.get_raw(key);
  let mut current: C = match &snapshot {
    Some(entry) => serde_json::from_value(entry.data.clone())?,
    None => C::default(),
  };
  optimistic(&mut current);
  cache.set(key, &current)?;
  debug!(key, "Applied optimistic change");

  match server.await {
    Ok(result) => {
      let mut latest = cache.get::<C>(key)?.map(|e| e.data).unwrap_or_default();
      reconcile(&mut latest, &result);
      cache.set(key, &latest)?;
      Ok(result)
    }
    Err(e) => {
      warn!(key, error = %e, "Mutation failed, rolling back");
      match snapshot {
        Some(entry) => cache.set_raw(key, entry.data),
        None => {
          cache.invalidate(key);
        }
      }
      Err(e)
    }
  }
}

fn replace_or_insert<T: Cacheable>(items: &mut Vec<T>, item: T) {
  match items.iter_mut().find(|i| i.cache_key() == item.cache_key()) {
    Some(slot) => *slot = item,
    None => items.insert(0, item),
  }
}

/// Show `item` in place of its cached version until `server` answers.
pub async fn optimistic_update<T, Fut>(
  cache: &CacheStore,
  key: &str,
  item: T,
  server: Fut,
) -> Result<T>
where
  T: Cacheable,
  Fut: Future<Output = Result<T>>,
{
  mutate_optimistic(
    cache,
    key,
    |items: &mut Vec<T>| replace_or_insert(items, item),
    server,
    |items, stored| replace_or_insert(items, stored.clone()),
  )
  .await
}

/// Prepend `item` (typically carrying a placeholder id) until `server`
/// returns the stored record, which then replaces the placeholder.
pub async fn optimistic_add<T, Fut>(cache: &CacheStore, key: &str, item: T, server: Fut) -> Result<T>
where
  T: Cacheable,
  Fut: Future<Output = Result<T>>,
{
  let placeholder = item.cache_key();
  mutate_optimistic(
    cache,
    key,
    |items: &mut Vec<T>| items.insert(0, item),
    server,
    move |items, stored| {
      items.retain(|i| i.cache_key() != placeholder);
      replace_or_insert(items, stored.clone());
    },
  )
  .await
}

/// Hide the item with `item_key` until `server` confirms the delete.
pub async fn optimistic_delete<T, Fut>(
  cache: &CacheStore,
  key: &str,
  item_key: &str,
  server: Fut,
) -> Result<()>
where
  T: Cacheable,
  Fut: Future<Output = Result<()>>,
{
  mutate_optimistic(
    cache,
    key,
    |items: &mut Vec<T>| items.retain(|i| i.cache_key() != item_key),
    server,
    |items, _| items.retain(|i| i.cache_key() != item_key),
  )
  .await
}

/// Listing writes that update the cached collection optimistically.
#[derive(Clone)]
pub struct PropertyMutations {
  client: Arc<QueryClient>,
  api: PropertyApi,
}

impl PropertyMutations {
  pub fn new(client: Arc<QueryClient>, api: PropertyApi) -> Self {
    Self { client, api }
  }

  fn collection_key() -> String {
    QueryKey::Properties.cache_key()
  }

  fn store_detail(&self, property: &Property) -> Result<()> {
    self
      .client
      .cache()
      .set(&QueryKey::Property(property.id).cache_key(), &Some(property.clone()))
  }

  /// Category and page views are filtered or windowed copies of the
  /// collection; drop them after any accepted write.
  fn invalidate_views(&self) {
    let categories = self.client.invalidate_prefix(QueryKey::CATEGORY_PREFIX);
    let pages = self.client.invalidate_prefix(QueryKey::PAGE_PREFIX);
    debug!(categories, pages, "Invalidated derived listing views");
  }

  pub async fn update(&self, property: Property) -> Result<Property> {
    let api = self.api.clone();
    let outgoing = property.clone();
    let stored = optimistic_update(
      self.client.cache(),
      &Self::collection_key(),
      property,
      async move { api.update(&outgoing).await },
    )
    .await?;
    self.invalidate_views();
    self.store_detail(&stored)?;
    Ok(stored)
  }

  /// Create a listing. `property.id` should be a placeholder (`0` or
  /// negative) that the backend replaces.
  pub async fn add(&self, property: Property) -> Result<Property> {
    let api = self.api.clone();
    let outgoing = property.clone();
    let stored = optimistic_add(
      self.client.cache(),
      &Self::collection_key(),
      property,
      async move { api.create(&outgoing).await },
    )
    .await?;
    self.invalidate_views();
    self.store_detail(&stored)?;
    Ok(stored)
  }

  pub async fn delete(&self, id: i64) -> Result<()> {
    let api = self.api.clone();
    optimistic_delete::<Property, _>(
      self.client.cache(),
      &Self::collection_key(),
      &id.to_string(),
      async move { api.delete(id).await },
    )
    .await?;
    self.invalidate_views();
    self.client.invalidate(&QueryKey::Property(id));
    Ok(())
  }
}
