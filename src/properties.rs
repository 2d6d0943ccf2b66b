//! Typed data access for listings.
//!
//! Every call is checked against the rate limiter, then runs as one unit of
//! work on the request queue, with transient failures retried inside that
//! unit. Rate-limit rejections surface immediately and are never retried.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::admission::{with_retry, RateLimiter, RequestQueue, RetryConfig};
use crate::backend::api_types::{property_from_json, PropertyRow};
use crate::backend::types::{ListingCategory, Page, Property};
use crate::backend::{Backend, RowQuery};
use crate::error::{Result, SyncError};

/// Column collections are ordered by, newest first.
pub const ORDER_COLUMN: &str = "created_at";

#[derive(Clone)]
pub struct PropertyApi {
  backend: Arc<dyn Backend>,
  table: String,
  limiter: Arc<RateLimiter>,
  queue: RequestQueue,
  retry: RetryConfig,
}

impl PropertyApi {
  pub fn new(
    backend: Arc<dyn Backend>,
    table: &str,
    limiter: Arc<RateLimiter>,
    queue: RequestQueue,
    retry: RetryConfig,
  ) -> Self {
    Self {
      backend,
      table: table.to_string(),
      limiter,
      queue,
      retry,
    }
  }

  pub fn backend(&self) -> &Arc<dyn Backend> {
    &self.backend
  }

  pub fn table(&self) -> &str {
    &self.table
  }

  /// Rate-limit, queue and retry one backend operation.
  async fn run<T, F, Fut>(&self, limit_key: &str, op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.limiter.check(limit_key)?;
    self
      .queue
      .add(|| with_retry(&self.retry, limit_key, op))
      .await
  }

  /// Map rows, skipping (and logging) rows that fail validation.
  fn map_rows(rows: Vec<Value>) -> Vec<Property> {
    rows
      .into_iter()
      .filter_map(|row| match property_from_json(row) {
        Ok(property) => Some(property),
        Err(e) => {
          warn!(error = %e, "Skipping malformed property row");
          None
        }
      })
      .collect()
  }

  pub async fn fetch_all(&self) -> Result<Vec<Property>> {
    let query = RowQuery::new().order_desc(ORDER_COLUMN);
    let set = self
      .run("properties:list", || self.backend.select(&self.table, &query))
      .await?;
    debug!(rows = set.rows.len(), "Fetched all properties");
    Ok(Self::map_rows(set.rows))
  }

  pub async fn fetch_by_id(&self, id: i64) -> Result<Option<Property>> {
    let row = self
      .run("properties:detail", || self.backend.select_one(&self.table, id))
      .await?;
    row.map(property_from_json).transpose()
  }

  pub async fn fetch_by_category(&self, category: ListingCategory) -> Result<Vec<Property>> {
    let query = RowQuery::new()
      .eq("categoria", category.as_str())
      .order_desc(ORDER_COLUMN);
    let set = self
      .run("properties:category", || {
        self.backend.select(&self.table, &query)
      })
      .await?;
    Ok(Self::map_rows(set.rows))
  }

  /// Fetch window `page` (0-based) of `page_size` rows with the exact total.
  pub async fn fetch_page(&self, page: usize, page_size: usize) -> Result<Page<Property>> {
    if page_size == 0 {
      return Err(SyncError::Validation("page size must be at least 1".into()));
    }
    let query = RowQuery::new()
      .order_desc(ORDER_COLUMN)
      .range((page * page_size) as u64, page_size as u64)
      .count_exact();
    let set = self
      .run("properties:page", || self.backend.select(&self.table, &query))
      .await?;

    let fetched = set.rows.len() as u64;
    Ok(Page {
      items: Self::map_rows(set.rows),
      page,
      page_size,
      total: set.total.unwrap_or((page * page_size) as u64 + fetched),
    })
  }

  pub async fn create(&self, property: &Property) -> Result<Property> {
    let mut row = serde_json::to_value(PropertyRow::from(property))?;
    if property.id <= 0 {
      if let Some(obj) = row.as_object_mut() {
        obj.remove("id");
      }
    }
    let stored = self
      .run("properties:write", || {
        self.backend.insert(&self.table, row.clone())
      })
      .await?;
    property_from_json(stored)
  }

  pub async fn update(&self, property: &Property) -> Result<Property> {
    let patch = PropertyRow::from(property).to_patch()?;
    let stored = self
      .run("properties:write", || {
        self.backend.update(&self.table, property.id, patch.clone())
      })
      .await?;
    property_from_json(stored)
  }

  /// Write a single column set on one row, returning the updated record.
  pub async fn patch(&self, id: i64, patch: Value) -> Result<Property> {
    let stored = self
      .run("properties:write", || {
        self.backend.update(&self.table, id, patch.clone())
      })
      .await?;
    property_from_json(stored)
  }

  pub async fn delete(&self, id: i64) -> Result<()> {
    self
      .run("properties:write", || self.backend.delete(&self.table, id))
      .await
  }

  /// Insert or merge records keyed by id.
  pub async fn upsert_many(&self, properties: &[Property]) -> Result<Vec<Property>> {
    let rows = properties
      .iter()
      .map(|p| serde_json::to_value(PropertyRow::from(p)))
      .collect::<std::result::Result<Vec<_>, _>>()?;
    let stored = self
      .run("properties:write", || {
        self.backend.upsert(&self.table, rows.clone(), "id")
      })
      .await?;
    Ok(Self::map_rows(stored))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::backend::memory::{sample_row, MemoryBackend};
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  pub(crate) const TABLE: &str = "propiedades";

  pub(crate) fn api_for(backend: Arc<MemoryBackend>) -> PropertyApi {
    PropertyApi::new(
      backend,
      TABLE,
      Arc::new(RateLimiter::default()),
      RequestQueue::new(4),
      RetryConfig::fixed(2, Duration::from_millis(10)),
    )
  }

  #[tokio::test]
  async fn test_fetch_all_is_newest_first() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 3));
    let api = api_for(backend);

    let ids: Vec<i64> = api.fetch_all().await.unwrap().iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
  }

  #[tokio::test]
  async fn test_fetch_by_category_filters_and_orders() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(
      TABLE,
      vec![
        sample_row(1, "rent"),
        sample_row(2, "sale"),
        sample_row(3, "rent"),
      ],
    );
    let api = api_for(backend);

    let rent = api.fetch_by_category(ListingCategory::Rent).await.unwrap();
    assert_eq!(rent.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3, 1]);
    assert!(rent.iter().all(|p| p.category == ListingCategory::Rent));
  }

  #[tokio::test]
  async fn test_fetch_by_id_missing_is_none() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 1));
    let api = api_for(backend);

    assert_eq!(api.fetch_by_id(1).await.unwrap().unwrap().price, 1_000_000.0);
    assert!(api.fetch_by_id(42).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_fetch_page_reports_total() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 25));
    let api = api_for(backend);

    let first = api.fetch_page(0, 20).await.unwrap();
    let second = api.fetch_page(1, 20).await.unwrap();
    assert_eq!(first.items.len(), 20);
    assert_eq!(second.items.len(), 5);
    assert_eq!(second.total, 25);
    assert_eq!(first.items[0].id, 25);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_are_retried_transparently() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 2));
    backend.fail_reads(vec![
      SyncError::Network("reset".into()),
      SyncError::Backend {
        status: 503,
        message: "unavailable".into(),
      },
    ]);
    let api = api_for(backend.clone());

    assert_eq!(api.fetch_all().await.unwrap().len(), 2);
    assert_eq!(backend.selects.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_permanent_failure_after_exhausting_retries() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 2));
    backend.fail_reads(vec![SyncError::Network("down".into()); 3]);
    let api = api_for(backend.clone());

    assert_eq!(
      api.fetch_all().await,
      Err(SyncError::Network("down".into()))
    );
    assert_eq!(backend.selects.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_rate_limit_rejects_without_calling_backend() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 1));
    let api = PropertyApi::new(
      backend.clone(),
      TABLE,
      Arc::new(RateLimiter::new(1, Duration::from_secs(60))),
      RequestQueue::new(4),
      RetryConfig::none(),
    );

    api.fetch_all().await.unwrap();
    assert!(matches!(
      api.fetch_all().await,
      Err(SyncError::RateLimited { .. })
    ));
    assert_eq!(backend.selects.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_malformed_rows_are_skipped() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 2));
    let mut broken = sample_row(3, "sale");
    broken["estado"] = serde_json::json!("sold");
    backend.seed(TABLE, vec![broken]);
    let api = api_for(backend);

    assert_eq!(api.fetch_all().await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_write_operations() {
    let backend = Arc::new(MemoryBackend::with_properties(TABLE, 1));
    let api = api_for(backend.clone());

    let mut property = api.fetch_by_id(1).await.unwrap().unwrap();
    property.title = "Penthouse".into();
    let updated = api.update(&property).await.unwrap();
    assert_eq!(updated.title, "Penthouse");
    assert_eq!(backend.row(TABLE, 1).unwrap()["titulo"], "Penthouse");

    let mut fresh = property.clone();
    fresh.id = 0;
    let created = api.create(&fresh).await.unwrap();
    assert_eq!(created.id, 2);

    api.delete(1).await.unwrap();
    assert!(backend.row(TABLE, 1).is_none());

    let mut renamed = created.clone();
    renamed.title = "Renamed".into();
    let upserted = api.upsert_many(&[renamed]).await.unwrap();
    assert_eq!(upserted[0].title, "Renamed");
    assert_eq!(backend.rows(TABLE).len(), 1);
  }
}
