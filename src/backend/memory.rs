//! In-memory backend for tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Backend, ObjectStorage, RowQuery, RowSet, UploadOptions};
use crate::error::{Result, SyncError};

#[derive(Default)]
pub struct MemoryBackend {
  tables: Mutex<BTreeMap<String, Vec<Value>>>,
  objects: Mutex<HashMap<String, Vec<u8>>>,
  failures: Mutex<VecDeque<SyncError>>,
  write_failures: Mutex<VecDeque<SyncError>>,
  failing_uploads: Mutex<Vec<String>>,
  latency: Mutex<Option<Duration>>,
  clock: AtomicUsize,
  pub selects: AtomicUsize,
  pub writes: AtomicUsize,
  pub uploads: AtomicUsize,
}

/// A listing row in backend shape.
pub fn sample_row(id: i64, category: &str) -> Value {
  json!({
    "id": id,
    "titulo": format!("Propiedad {}", id),
    "ubicacion": "Medellín",
    "precio": (id * 1_000_000).to_string(),
    "tipo": "apartamento",
    "habitaciones": 3,
    "banos": 2,
    "area": "80",
    "imagen": format!("https://cdn.example.com/{}.jpg", id),
    "descripcion": "",
    "caracteristicas": [],
    "estado": "available",
    "categoria": category,
  })
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed `table` with rows; later rows count as newer.
  pub fn seed(&self, table: &str, rows: Vec<Value>) {
    let mut tables = self.tables.lock().unwrap();
    let stored = tables.entry(table.to_string()).or_default();
    for row in rows {
      stored.push(self.stamp(row));
    }
  }

  /// `count` rows with ids 1..=count in the "sale" category.
  pub fn with_properties(table: &str, count: i64) -> Self {
    let backend = Self::new();
    backend.seed(table, (1..=count).map(|id| sample_row(id, "sale")).collect());
    backend
  }

  fn stamp(&self, mut row: Value) -> Value {
    if row.get("created_at").is_none() {
      let tick = self.clock.fetch_add(1, Ordering::SeqCst);
      row["created_at"] = json!(format!("2024-01-01T00:00:{:06}Z", tick));
    }
    row
  }

  /// Make the next `select`/`select_one` calls fail with these errors.
  pub fn fail_reads(&self, errors: Vec<SyncError>) {
    self.failures.lock().unwrap().extend(errors);
  }

  /// Make the next write calls fail with these errors.
  pub fn fail_writes(&self, errors: Vec<SyncError>) {
    self.write_failures.lock().unwrap().extend(errors);
  }

  /// Uploads whose path contains `fragment` fail.
  pub fn fail_uploads_containing(&self, fragment: &str) {
    self.failing_uploads.lock().unwrap().push(fragment.to_string());
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = Some(latency);
  }

  pub fn rows(&self, table: &str) -> Vec<Value> {
    self
      .tables
      .lock()
      .unwrap()
      .get(table)
      .cloned()
      .unwrap_or_default()
  }

  pub fn row(&self, table: &str, id: i64) -> Option<Value> {
    self.rows(table).into_iter().find(|r| r["id"] == id)
  }

  pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
    self
      .objects
      .lock()
      .unwrap()
      .get(&format!("{}/{}", bucket, path))
      .cloned()
  }

  pub fn object_paths(&self) -> Vec<String> {
    let mut paths: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
    paths.sort();
    paths
  }

  async fn simulate_latency(&self) {
    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }
  }

  fn next_read_failure(&self) -> Option<SyncError> {
    self.failures.lock().unwrap().pop_front()
  }

  fn next_write_failure(&self) -> Option<SyncError> {
    self.write_failures.lock().unwrap().pop_front()
  }
}

fn matches_filter(row: &Value, column: &str, expected: &str) -> bool {
  match row.get(column) {
    Some(Value::String(s)) => s == expected,
    Some(other) => other.to_string() == expected,
    None => false,
  }
}

fn sort_key(row: &Value, column: &str) -> String {
  match row.get(column) {
    Some(Value::String(s)) => s.clone(),
    Some(Value::Number(n)) => format!("{:020}", n.as_f64().unwrap_or(0.0) as i64),
    Some(other) => other.to_string(),
    None => String::new(),
  }
}

#[async_trait]
impl Backend for MemoryBackend {
  async fn select(&self, table: &str, query: &RowQuery) -> Result<RowSet> {
    self.selects.fetch_add(1, Ordering::SeqCst);
    self.simulate_latency().await;
    if let Some(err) = self.next_read_failure() {
      return Err(err);
    }

    let mut rows: Vec<Value> = self
      .rows(table)
      .into_iter()
      .filter(|row| {
        query
          .filters
          .iter()
          .all(|(column, value)| matches_filter(row, column, value))
      })
      .collect();

    if let Some(order) = &query.order {
      rows.sort_by_key(|row| sort_key(row, &order.column));
      if order.descending {
        rows.reverse();
      }
    }

    let total = rows.len() as u64;
    let offset = query.offset.unwrap_or(0) as usize;
    let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    let rows = rows.into_iter().skip(offset).take(limit).collect();

    Ok(RowSet {
      rows,
      total: query.count_exact.then_some(total),
    })
  }

  async fn select_one(&self, table: &str, id: i64) -> Result<Option<Value>> {
    self.selects.fetch_add(1, Ordering::SeqCst);
    self.simulate_latency().await;
    if let Some(err) = self.next_read_failure() {
      return Err(err);
    }
    Ok(self.row(table, id))
  }

  async fn insert(&self, table: &str, mut row: Value) -> Result<Value> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.simulate_latency().await;
    if let Some(err) = self.next_write_failure() {
      return Err(err);
    }

    let mut tables = self.tables.lock().unwrap();
    let stored = tables.entry(table.to_string()).or_default();
    if row.get("id").map_or(true, Value::is_null) {
      let next = stored
        .iter()
        .filter_map(|r| r["id"].as_i64())
        .max()
        .unwrap_or(0)
        + 1;
      row["id"] = json!(next);
    }
    let row = self.stamp(row);
    stored.push(row.clone());
    Ok(row)
  }

  async fn update(&self, table: &str, id: i64, patch: Value) -> Result<Value> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.simulate_latency().await;
    if let Some(err) = self.next_write_failure() {
      return Err(err);
    }

    let mut tables = self.tables.lock().unwrap();
    let row = tables
      .get_mut(table)
      .and_then(|rows| rows.iter_mut().find(|r| r["id"] == id))
      .ok_or_else(|| SyncError::NotFound(format!("{} row {}", table, id)))?;

    if let (Some(target), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
      for (k, v) in changes {
        target.insert(k.clone(), v.clone());
      }
    }
    Ok(row.clone())
  }

  async fn upsert(&self, table: &str, rows: Vec<Value>, on_conflict: &str) -> Result<Vec<Value>> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    if let Some(err) = self.next_write_failure() {
      return Err(err);
    }

    let mut out = Vec::new();
    for row in rows {
      let key = row.get(on_conflict).cloned().unwrap_or(Value::Null);
      let mut tables = self.tables.lock().unwrap();
      let stored = tables.entry(table.to_string()).or_default();
      match stored.iter_mut().find(|r| r.get(on_conflict) == Some(&key)) {
        Some(existing) => {
          if let (Some(target), Some(changes)) = (existing.as_object_mut(), row.as_object()) {
            for (k, v) in changes {
              target.insert(k.clone(), v.clone());
            }
          }
          out.push(existing.clone());
        }
        None => {
          let row = self.stamp(row);
          stored.push(row.clone());
          out.push(row);
        }
      }
    }
    Ok(out)
  }

  async fn delete(&self, table: &str, id: i64) -> Result<()> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    if let Some(err) = self.next_write_failure() {
      return Err(err);
    }
    if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
      rows.retain(|r| r["id"] != id);
    }
    Ok(())
  }
}

#[async_trait]
impl ObjectStorage for MemoryBackend {
  async fn upload(
    &self,
    bucket: &str,
    path: &str,
    bytes: Vec<u8>,
    options: &UploadOptions,
  ) -> Result<String> {
    self.uploads.fetch_add(1, Ordering::SeqCst);
    let failing = self
      .failing_uploads
      .lock()
      .unwrap()
      .iter()
      .any(|f| path.contains(f.as_str()));
    if failing {
      return Err(SyncError::Upload {
        path: path.to_string(),
        message: "simulated failure".into(),
      });
    }

    let key = format!("{}/{}", bucket, path);
    let mut objects = self.objects.lock().unwrap();
    if objects.contains_key(&key) && !options.upsert {
      return Err(SyncError::Upload {
        path: path.to_string(),
        message: "object already exists".into(),
      });
    }
    objects.insert(key, bytes);
    Ok(path.to_string())
  }

  fn public_url(&self, bucket: &str, path: &str) -> String {
    format!("https://storage.test/{}/{}", bucket, path)
  }
}
