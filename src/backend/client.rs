use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Backend, ObjectStorage, RowQuery, RowSet, UploadOptions};
use crate::config::Config;
use crate::error::{Result, SyncError};

/// HTTP client for the hosted backend (REST rows + object storage).
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  /// Bearer token of the signed-in user, falls back to the API key
  access_token: Arc<RwLock<Option<String>>>,
}

impl RestClient {
  pub fn new(base_url: &str, api_key: String) -> Result<Self> {
    let base = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("invalid backend url '{}': {}", base_url, e)))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base,
      api_key,
      access_token: Arc::new(RwLock::new(None)),
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(&config.backend.url, Config::get_api_key()?)
  }

  /// Use a user session token for subsequent requests (None reverts to the API key).
  pub fn set_access_token(&self, token: Option<String>) {
    let mut guard = self.access_token.write().unwrap_or_else(|e| e.into_inner());
    *guard = token;
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  pub(crate) fn http(&self) -> &reqwest::Client {
    &self.http
  }

  pub(crate) fn api_key(&self) -> &str {
    &self.api_key
  }

  fn headers(&self) -> HeaderMap {
    let token = self
      .access_token
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
      .unwrap_or_else(|| self.api_key.clone());

    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&self.api_key) {
      headers.insert("apikey", v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) {
      headers.insert("Authorization", v);
    }
    headers
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| SyncError::Config(format!("invalid endpoint '{}': {}", path, e)))
  }

  fn table_url(&self, table: &str) -> Result<Url> {
    self.endpoint(&format!("rest/v1/{}", table))
  }
}

/// Build the PostgREST URL for a row query.
pub(crate) fn select_url(mut url: Url, query: &RowQuery) -> Url {
  {
    let mut pairs = url.query_pairs_mut();
    pairs.append_pair("select", "*");
    for (column, value) in &query.filters {
      pairs.append_pair(column, &format!("eq.{}", value));
    }
    if let Some(order) = &query.order {
      let direction = if order.descending { "desc" } else { "asc" };
      pairs.append_pair("order", &format!("{}.{}", order.column, direction));
    }
    if let Some(offset) = query.offset {
      pairs.append_pair("offset", &offset.to_string());
    }
    if let Some(limit) = query.limit {
      pairs.append_pair("limit", &limit.to_string());
    }
  }
  url
}

/// Total from a `Content-Range` header such as `0-19/25` or `*/0`.
pub(crate) fn parse_content_range(value: &str) -> Option<u64> {
  value.rsplit('/').next()?.trim().parse().ok()
}

/// Translate a non-success response into a `SyncError`.
async fn error_for_response(context: &str, response: Response) -> SyncError {
  let status = response.status();
  let retry_after = response
    .headers()
    .get(RETRY_AFTER)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse::<u64>().ok())
    .map(Duration::from_secs);
  let body = response.text().await.unwrap_or_default();

  match status {
    StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited {
      key: context.to_string(),
      retry_after: retry_after.unwrap_or(Duration::from_secs(60)),
    },
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
      SyncError::Unauthorized(format!("{}: {}", context, body))
    }
    StatusCode::NOT_FOUND => SyncError::NotFound(context.to_string()),
    _ => SyncError::Backend {
      status: status.as_u16(),
      message: format!("{}: {}", context, body),
    },
  }
}

async fn json_or_error(context: &str, response: Response) -> Result<Value> {
  if !response.status().is_success() {
    return Err(error_for_response(context, response).await);
  }
  Ok(response.json::<Value>().await?)
}

/// PostgREST returns a one-element array for single-row writes.
fn first_row(context: &str, value: Value) -> Result<Value> {
  match value {
    Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
    Value::Array(_) => Err(SyncError::NotFound(context.to_string())),
    other => Ok(other),
  }
}

#[async_trait]
impl Backend for RestClient {
  async fn select(&self, table: &str, query: &RowQuery) -> Result<RowSet> {
    let url = select_url(self.table_url(table)?, query);
    debug!(table, url = %url, "Selecting rows");

    let mut request = self.http.get(url).headers(self.headers());
    if query.count_exact {
      request = request.header("Prefer", "count=exact");
    }
    let response = request.send().await?;

    if !response.status().is_success() {
      return Err(error_for_response(table, response).await);
    }

    let total = response
      .headers()
      .get(CONTENT_RANGE)
      .and_then(|v| v.to_str().ok())
      .and_then(parse_content_range);

    let rows: Vec<Value> = response.json().await?;
    Ok(RowSet { rows, total })
  }

  async fn select_one(&self, table: &str, id: i64) -> Result<Option<Value>> {
    let query = RowQuery::new().eq("id", id).range(0, 1);
    let set = self.select(table, &query).await?;
    Ok(set.rows.into_iter().next())
  }

  async fn insert(&self, table: &str, row: Value) -> Result<Value> {
    let context = format!("insert into {}", table);
    let response = self
      .http
      .post(self.table_url(table)?)
      .headers(self.headers())
      .header("Prefer", "return=representation")
      .json(&row)
      .send()
      .await?;

    first_row(&context, json_or_error(&context, response).await?)
  }

  async fn update(&self, table: &str, id: i64, patch: Value) -> Result<Value> {
    let context = format!("{} row {}", table, id);
    let url = select_url(self.table_url(table)?, &RowQuery::new().eq("id", id));
    let response = self
      .http
      .patch(url)
      .headers(self.headers())
      .header("Prefer", "return=representation")
      .json(&patch)
      .send()
      .await?;

    first_row(&context, json_or_error(&context, response).await?)
  }

  async fn upsert(&self, table: &str, rows: Vec<Value>, on_conflict: &str) -> Result<Vec<Value>> {
    let context = format!("upsert into {}", table);
    let mut url = self.table_url(table)?;
    url.query_pairs_mut().append_pair("on_conflict", on_conflict);

    let response = self
      .http
      .post(url)
      .headers(self.headers())
      .header("Prefer", "resolution=merge-duplicates,return=representation")
      .json(&rows)
      .send()
      .await?;

    match json_or_error(&context, response).await? {
      Value::Array(rows) => Ok(rows),
      other => Ok(vec![other]),
    }
  }

  async fn delete(&self, table: &str, id: i64) -> Result<()> {
    let context = format!("{} row {}", table, id);
    let url = select_url(self.table_url(table)?, &RowQuery::new().eq("id", id));
    let response = self
      .http
      .delete(url)
      .headers(self.headers())
      .send()
      .await?;

    if !response.status().is_success() {
      return Err(error_for_response(&context, response).await);
    }
    Ok(())
  }
}

#[async_trait]
impl ObjectStorage for RestClient {
  async fn upload(
    &self,
    bucket: &str,
    path: &str,
    bytes: Vec<u8>,
    options: &UploadOptions,
  ) -> Result<String> {
    let url = self.endpoint(&format!("storage/v1/object/{}/{}", bucket, path))?;
    let content_type = options
      .content_type
      .clone()
      .unwrap_or_else(|| "application/octet-stream".to_string());

    let response = self
      .http
      .post(url)
      .headers(self.headers())
      .header("cache-control", format!("max-age={}", options.cache_control))
      .header("x-upsert", options.upsert.to_string())
      .header(CONTENT_TYPE, content_type)
      .body(bytes)
      .send()
      .await
      .map_err(|e| SyncError::Upload {
        path: path.to_string(),
        message: e.to_string(),
      })?;

    if !response.status().is_success() {
      let message = error_for_response(path, response).await.to_string();
      return Err(SyncError::Upload {
        path: path.to_string(),
        message,
      });
    }
    Ok(path.to_string())
  }

  fn public_url(&self, bucket: &str, path: &str) -> String {
    format!(
      "{}/storage/v1/object/public/{}/{}",
      self.base.as_str().trim_end_matches('/'),
      bucket,
      path
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client() -> RestClient {
    RestClient::new("https://demo.supabase.co/", "anon".into()).unwrap()
  }

  #[test]
  fn test_select_url_encodes_filters_order_and_range() {
    let base = client().table_url("propiedades").unwrap();
    let query = RowQuery::new()
      .eq("categoria", "rent")
      .order_desc("created_at")
      .range(40, 20);

    let url = select_url(base, &query);
    assert_eq!(url.path(), "/rest/v1/propiedades");
    assert_eq!(
      url.query(),
      Some("select=*&categoria=eq.rent&order=created_at.desc&offset=40&limit=20")
    );
  }

  #[test]
  fn test_parse_content_range() {
    assert_eq!(parse_content_range("0-19/25"), Some(25));
    assert_eq!(parse_content_range("*/0"), Some(0));
    assert_eq!(parse_content_range("0-19/*"), None);
  }

  #[test]
  fn test_public_url() {
    assert_eq!(
      client().public_url("propiedades", "principal/1-1700000000000-ab12cd.jpg"),
      "https://demo.supabase.co/storage/v1/object/public/propiedades/principal/1-1700000000000-ab12cd.jpg"
    );
  }

  #[test]
  fn test_invalid_base_url_is_a_config_error() {
    assert!(matches!(
      RestClient::new("not a url", "anon".into()),
      Err(SyncError::Config(_))
    ));
  }

  #[test]
  fn test_first_row() {
    let row = first_row("t", serde_json::json!([{"id": 1}])).unwrap();
    assert_eq!(row["id"], 1);
    assert!(matches!(
      first_row("t", serde_json::json!([])),
      Err(SyncError::NotFound(_))
    ));
  }
}
