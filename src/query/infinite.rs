//! Infinite-scroll pagination over the cached page windows.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::client::QueryClient;
use super::keys::QueryKey;
use crate::backend::types::{Page, Property};
use crate::error::{Result, SyncError};
use crate::properties::PropertyApi;

/// Ordered list of loaded pages, newest listings first.
///
/// Each page is cached under its own key, so re-opening a scroll view serves
/// pages from the cache while they revalidate.
pub struct InfiniteQuery {
  client: Arc<QueryClient>,
  api: PropertyApi,
  page_size: usize,
  pages: Vec<Page<Property>>,
  error: Option<SyncError>,
}

impl InfiniteQuery {
  pub fn new(client: Arc<QueryClient>, api: PropertyApi, page_size: usize) -> Self {
    Self {
      client,
      api,
      page_size: page_size.max(1),
      pages: Vec::new(),
      error: None,
    }
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn page_count(&self) -> usize {
    self.pages.len()
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.error.as_ref()
  }

  /// Total rows reported by the most recent page.
  pub fn total(&self) -> Option<u64> {
    self.pages.last().map(|p| p.total)
  }

  async fn fetch_page(&self, page: usize, force: bool) -> Result<Page<Property>> {
    let key = QueryKey::Page {
      page,
      size: self.page_size,
    };
    let api = self.api.clone();
    let size = self.page_size;
    let fetcher = move || async move { api.fetch_page(page, size).await };
    let result = if force {
      self.client.refetch(&key, fetcher).await?
    } else {
      self.client.fetch(&key, fetcher).await?
    };
    Ok(result.data)
  }

  fn record<T>(&mut self, result: Result<T>) -> Result<T> {
    match &result {
      Ok(_) => self.error = None,
      Err(e) => self.error = Some(e.clone()),
    }
    result
  }

  /// Reset to the first page only.
  pub async fn load_first(&mut self) -> Result<()> {
    let result = self.fetch_page(0, false).await;
    let first = self.record(result)?;
    self.pages = vec![first];
    Ok(())
  }

  /// Load the next page. Returns `false` when there was nothing more to load.
  pub async fn load_more(&mut self) -> Result<bool> {
    if self.pages.is_empty() {
      self.load_first().await?;
      return Ok(true);
    }
    if !self.has_more() {
      return Ok(false);
    }

    let next = self.pages.len();
    debug!(page = next, size = self.page_size, "Loading next page");
    let result = self.fetch_page(next, false).await;
    let page = self.record(result)?;
    self.pages.push(page);
    Ok(true)
  }

  /// Refetch every loaded page in parallel.
  ///
  /// Pages that fail keep their previous contents; the first error is
  /// returned after all pages settle.
  pub async fn refresh(&mut self) -> Result<()> {
    let results = join_all((0..self.pages.len()).map(|page| self.fetch_page(page, true))).await;

    let mut first_error = None;
    for (slot, result) in self.pages.iter_mut().zip(results) {
      match result {
        Ok(page) => *slot = page,
        Err(e) => {
          first_error.get_or_insert(e);
        }
      }
    }
    let outcome = first_error.map_or(Ok(()), Err);
    self.record(outcome)
  }

  /// Items of every loaded page in page order, first occurrence of each id
  /// kept. Rows shift between pages when listings are added mid-scroll.
  pub fn items(&self) -> Vec<Property> {
    let mut seen = HashSet::new();
    self
      .pages
      .iter()
      .flat_map(|p| p.items.iter())
      .filter(|p| seen.insert(p.id))
      .cloned()
      .collect()
  }

  /// Whether the backend reports more rows than have been fetched.
  ///
  /// True before the first page is loaded.
  pub fn has_more(&self) -> bool {
    match self.pages.last() {
      None => true,
      Some(last) => {
        let fetched = self.pages.iter().map(|p| p.items.len() as u64).sum::<u64>();
        !last.items.is_empty() && fetched < last.total
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::memory::MemoryBackend;
  use crate::cache::CacheStore;
  use crate::properties::tests::{api_for, TABLE};
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  fn infinite(backend: Arc<MemoryBackend>) -> InfiniteQuery {
    let client = Arc::new(QueryClient::new(
      Arc::new(CacheStore::new(Duration::from_secs(60))),
      Duration::from_secs(5),
    ));
    InfiniteQuery::new(client, api_for(backend), 20)
  }

  #[tokio::test(start_paused = true)]
  async fn test_two_pages_of_twenty_five_rows() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 25));
    let mut query = infinite(backend);

    query.load_first().await.unwrap();
    assert!(query.has_more());
    assert_eq!(query.items().len(), 20);

    assert!(query.load_more().await.unwrap());
    assert!(!query.has_more());

    let items = query.items();
    assert_eq!(items.len(), 25);
    let unique: HashSet<i64> = items.iter().map(|p| p.id).collect();
    assert_eq!(unique.len(), 25);
    assert_eq!(items.first().map(|p| p.id), Some(25));
    assert_eq!(items.last().map(|p| p.id), Some(1));

    assert!(!query.load_more().await.unwrap());
    assert_eq!(query.page_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_empty_table_has_nothing_more() {
    let backend = Arc::new(MemoryBackend::new());
    let mut query = infinite(backend);

    assert!(query.has_more());
    query.load_first().await.unwrap();
    assert!(!query.has_more());
    assert!(query.items().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_shifted_rows_are_not_duplicated() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 25));
    let mut query = infinite(backend.clone());
    query.load_first().await.unwrap();

    // A new listing pushes row 6 from page 0 onto page 1.
    backend.seed(TABLE, vec![crate::backend::memory::sample_row(26, "sale")]);
    query.load_more().await.unwrap();

    let items = query.items();
    let unique: HashSet<i64> = items.iter().map(|p| p.id).collect();
    assert_eq!(unique.len(), items.len());
    assert_eq!(items.len(), 25);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_refetches_every_page() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 25));
    let mut query = infinite(backend.clone());
    query.load_first().await.unwrap();
    query.load_more().await.unwrap();
    assert_eq!(backend.selects.load(Ordering::SeqCst), 2);

    query.refresh().await.unwrap();
    assert_eq!(backend.selects.load(Ordering::SeqCst), 4);
    assert_eq!(query.items().len(), 25);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_page_keeps_loaded_pages() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 25));
    let mut query = infinite(backend.clone());
    query.load_first().await.unwrap();

    backend.fail_reads(vec![SyncError::Network("down".into()); 3]);
    assert!(query.load_more().await.is_err());
    assert_eq!(query.page_count(), 1);
    assert!(query.error().is_some());
    assert!(query.has_more());
  }
}
