//! TTL-stamped in-memory cache store.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Result;

/// A cache hit. Staleness never hides data; it only signals that a
/// background refresh is due.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub data: T,
  pub is_stale: bool,
  pub inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
  Set,
  Invalidated,
}

/// Announcement of a change to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
  pub key: String,
  pub kind: CacheEventKind,
}

#[derive(Debug, Clone)]
struct StoredEntry {
  payload: Value,
  inserted_at: Instant,
}

/// Process-wide store shared by every query. Construct one per session (or
/// per test) and pass it to the `QueryClient`.
pub struct CacheStore {
  entries: Mutex<HashMap<String, StoredEntry>>,
  ttl: Duration,
  events: broadcast::Sender<CacheEvent>,
}

impl CacheStore {
  pub fn new(ttl: Duration) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      entries: Mutex::new(HashMap::new()),
      ttl,
      events,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, StoredEntry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn publish(&self, key: &str, kind: CacheEventKind) {
    // No receivers is fine, nobody is watching yet.
    let _ = self.events.send(CacheEvent {
      key: key.to_string(),
      kind,
    });
  }

  /// Receive an event for every subsequent `set` and invalidation.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  /// Raw JSON payload for `key`, stale or not.
  pub fn get_raw(&self, key: &str) -> Option<CacheEntry<Value>> {
    let entries = self.entries();
    entries.get(key).map(|stored| CacheEntry {
      data: stored.payload.clone(),
      is_stale: stored.inserted_at.elapsed() > self.ttl,
      inserted_at: stored.inserted_at,
    })
  }

  /// Typed payload for `key`, stale or not.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
    match self.get_raw(key) {
      Some(entry) => Ok(Some(CacheEntry {
        data: serde_json::from_value(entry.data)?,
        is_stale: entry.is_stale,
        inserted_at: entry.inserted_at,
      })),
      None => Ok(None),
    }
  }

  pub fn set_raw(&self, key: &str, payload: Value) {
    self.entries().insert(
      key.to_string(),
      StoredEntry {
        payload,
        inserted_at: Instant::now(),
      },
    );
    trace!(key, "Cache set");
    self.publish(key, CacheEventKind::Set);
  }

  pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let payload = serde_json::to_value(value)?;
    self.set_raw(key, payload);
    Ok(())
  }

  /// Remove `key` so the next read is a miss. Returns whether it existed.
  pub fn invalidate(&self, key: &str) -> bool {
    let existed = self.entries().remove(key).is_some();
    if existed {
      trace!(key, "Cache invalidated");
      self.publish(key, CacheEventKind::Invalidated);
    }
    existed
  }

  /// Remove every key starting with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let removed: Vec<String> = {
      let mut entries = self.entries();
      let keys: Vec<String> = entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      for key in &keys {
        entries.remove(key);
      }
      keys
    };
    for key in &removed {
      self.publish(key, CacheEventKind::Invalidated);
    }
    removed.len()
  }

  pub fn invalidate_all(&self) {
    let removed: Vec<String> = self.entries().drain().map(|(k, _)| k).collect();
    for key in &removed {
      self.publish(key, CacheEventKind::Invalidated);
    }
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.entries().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
