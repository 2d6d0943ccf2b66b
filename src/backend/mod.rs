//! Hosted backend access: row CRUD, object storage and auth.
//!
//! The traits here are the seams the rest of the crate is written against.
//! `RestClient` talks to a PostgREST/Supabase-style service over HTTP; tests
//! use the in-memory implementation.

pub mod api_types;
pub mod auth;
pub mod client;
#[cfg(test)]
pub mod memory;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use api_types::PropertyRow;
pub use auth::{AuthClient, Role, Session, User};
pub use client::RestClient;
pub use types::{ListingCategory, Page, Property, PropertyStatus};

/// Column and direction for ordering a row query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
  pub column: String,
  pub descending: bool,
}

/// Shape of a row-set query: equality filters, ordering and an optional
/// offset/limit window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowQuery {
  pub filters: Vec<(String, String)>,
  pub order: Option<Order>,
  pub offset: Option<u64>,
  pub limit: Option<u64>,
  /// Ask the backend for the exact number of matching rows
  pub count_exact: bool,
}

impl RowQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
    self.filters.push((column.to_string(), value.to_string()));
    self
  }

  pub fn order_desc(mut self, column: &str) -> Self {
    self.order = Some(Order {
      column: column.to_string(),
      descending: true,
    });
    self
  }

  pub fn range(mut self, offset: u64, limit: u64) -> Self {
    self.offset = Some(offset);
    self.limit = Some(limit);
    self
  }

  pub fn count_exact(mut self) -> Self {
    self.count_exact = true;
    self
  }
}

/// Rows returned by a query, plus the exact total when it was requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
  pub rows: Vec<Value>,
  pub total: Option<u64>,
}

/// Row-level access to backend tables.
#[async_trait]
pub trait Backend: Send + Sync {
  async fn select(&self, table: &str, query: &RowQuery) -> Result<RowSet>;

  async fn select_one(&self, table: &str, id: i64) -> Result<Option<Value>>;

  /// Insert one row and return it as stored.
  async fn insert(&self, table: &str, row: Value) -> Result<Value>;

  /// Apply `patch` to the row with `id` and return the updated row.
  async fn update(&self, table: &str, id: i64, patch: Value) -> Result<Value>;

  /// Insert or merge rows, resolving conflicts on `on_conflict`.
  async fn upsert(&self, table: &str, rows: Vec<Value>, on_conflict: &str) -> Result<Vec<Value>>;

  async fn delete(&self, table: &str, id: i64) -> Result<()>;
}

/// Options for an object upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
  /// Cache-Control max-age in seconds
  pub cache_control: String,
  /// Overwrite an existing object at the same path
  pub upsert: bool,
  pub content_type: Option<String>,
}

impl Default for UploadOptions {
  fn default() -> Self {
    Self {
      cache_control: "3600".to_string(),
      upsert: false,
      content_type: None,
    }
  }
}

/// Blob store with public URLs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
  /// Store `bytes` at `path` in `bucket` and return the stored path.
  async fn upload(
    &self,
    bucket: &str,
    path: &str,
    bytes: Vec<u8>,
    options: &UploadOptions,
  ) -> Result<String>;

  fn public_url(&self, bucket: &str, path: &str) -> String;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_row_query_builder() {
    let query = RowQuery::new()
      .eq("categoria", "rent")
      .order_desc("created_at")
      .range(20, 20)
      .count_exact();

    assert_eq!(query.filters, vec![("categoria".to_string(), "rent".to_string())]);
    assert_eq!(
      query.order,
      Some(Order {
        column: "created_at".into(),
        descending: true
      })
    );
    assert_eq!(query.offset, Some(20));
    assert_eq!(query.limit, Some(20));
    assert!(query.count_exact);
  }
}
