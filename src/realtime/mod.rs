//! Realtime change merging.
//!
//! Row changes pushed by the backend land in a side map keyed by id. The
//! visible collection is the cached base list with side-map entries laid
//! over it, so a change shows up before the base query has revalidated.

mod feed;
mod subscription;

pub use feed::{ChangeFeed, PollingFeed};
pub use subscription::{Subscription, SubscriptionState};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::admission::Debouncer;
use crate::backend::api_types::property_from_json;
use crate::backend::types::Property;
use crate::error::{Result, SyncError};
use crate::properties::PropertyApi;
use crate::query::{QueryClient, QueryKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// One row change as delivered on the change channel.
///
/// Wire shape: `{"eventType": "UPDATE", "new": {...}, "old": {...}}`. Deletes
/// carry the row (at least its id) in `old`; inserts may send `old: {}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  #[serde(rename = "eventType")]
  pub event_type: ChangeKind,
  #[serde(rename = "new", default)]
  pub new_row: Value,
  #[serde(rename = "old", default)]
  pub old_row: Value,
}

impl ChangeEvent {
  pub fn insert(row: Value) -> Self {
    Self {
      event_type: ChangeKind::Insert,
      new_row: row,
      old_row: Value::Null,
    }
  }

  pub fn update(row: Value, old: Value) -> Self {
    Self {
      event_type: ChangeKind::Update,
      new_row: row,
      old_row: old,
    }
  }

  pub fn delete(old: Value) -> Self {
    Self {
      event_type: ChangeKind::Delete,
      new_row: Value::Null,
      old_row: old,
    }
  }

  /// Id of the affected row, from `new` or else `old`.
  pub fn id(&self) -> Option<i64> {
    self
      .new_row
      .get("id")
      .and_then(Value::as_i64)
      .or_else(|| self.old_row.get("id").and_then(Value::as_i64))
  }
}

/// Pending changes by id, merged over a base collection.
#[derive(Debug, Clone, Default)]
pub struct MergeLayer {
  pending: BTreeMap<i64, Property>,
}

impl MergeLayer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Apply one event. Applying the same event again leaves the layer
  /// unchanged. Returns the affected id.
  pub fn apply(&mut self, event: &ChangeEvent) -> Result<i64> {
    match event.event_type {
      ChangeKind::Insert | ChangeKind::Update => {
        let property = property_from_json(event.new_row.clone())?;
        let id = property.id;
        self.pending.insert(id, property);
        Ok(id)
      }
      ChangeKind::Delete => {
        let id = event
          .id()
          .ok_or_else(|| SyncError::Decode("delete event without a row id".into()))?;
        self.pending.remove(&id);
        Ok(id)
      }
    }
  }

  /// `base` with pending versions substituted by id, then pending rows
  /// that `base` does not contain, in id order.
  pub fn merged(&self, base: &[Property]) -> Vec<Property> {
    let mut out: Vec<Property> = base
      .iter()
      .map(|p| self.pending.get(&p.id).unwrap_or(p).clone())
      .collect();
    out.extend(
      self
        .pending
        .values()
        .filter(|pending| !base.iter().any(|p| p.id == pending.id))
        .cloned(),
    );
    out
  }

  pub fn get(&self, id: i64) -> Option<&Property> {
    self.pending.get(&id)
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }
}

/// Applies change events to the merge layer and the shared cache.
pub struct RealtimeSync {
  client: Arc<QueryClient>,
  api: PropertyApi,
  layer: Mutex<MergeLayer>,
  applied: broadcast::Sender<ChangeEvent>,
  debounce: Option<(Debouncer<()>, Duration)>,
}

impl RealtimeSync {
  pub fn new(client: Arc<QueryClient>, api: PropertyApi) -> Self {
    let (applied, _) = broadcast::channel(64);
    Self {
      client,
      api,
      layer: Mutex::new(MergeLayer::new()),
      applied,
      debounce: None,
    }
  }

  /// Collapse base revalidations triggered by bursts of events into one
  /// fetch per `delay`.
  pub fn with_debounce(mut self, delay: Duration) -> Self {
    self.debounce = Some((Debouncer::new(), delay));
    self
  }

  fn layer(&self) -> MutexGuard<'_, MergeLayer> {
    self.layer.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Receive every event after it has been applied.
  pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
    self.applied.subscribe()
  }

  /// Apply `event`, refresh the per-id cache entry and revalidate the base
  /// collection in the background.
  pub fn handle(&self, event: ChangeEvent) -> Result<()> {
    let id = self.layer().apply(&event)?;
    debug!(id, kind = ?event.event_type, "Applied realtime change");

    let cache = self.client.cache();
    let detail_key = QueryKey::Property(id).cache_key();
    match event.event_type {
      ChangeKind::Delete => {
        cache.invalidate(&detail_key);
      }
      ChangeKind::Insert | ChangeKind::Update => {
        if let Some(property) = self.layer().get(id).cloned() {
          cache.set(&detail_key, &Some(property))?;
        }
      }
    }

    self.revalidate_base();
    // No listeners is fine
    let _ = self.applied.send(event);
    Ok(())
  }

  fn revalidate_base(&self) {
    let key = QueryKey::Properties.cache_key();
    let Some((debouncer, delay)) = &self.debounce else {
      let fetch = revalidate_all(&self.client, &self.api);
      crate::query::spawn_logged(key, fetch);
      return;
    };

    let debouncer = debouncer.clone();
    let delay = *delay;
    let client = self.client.clone();
    let api = self.api.clone();
    tokio::spawn(async move {
      let work = move || {
        let fetch = revalidate_all(&client, &api);
        async move { fetch.await.map(|_| ()) }
      };
      match debouncer.debounce(&key, work, delay).await {
        Ok(()) | Err(SyncError::Cancelled(_)) => {}
        Err(e) => warn!(key = %key, error = %e, "Base revalidation failed"),
      }
    });
  }

  /// Cached base collection with pending changes merged in.
  pub fn merged_properties(&self) -> Result<Vec<Property>> {
    let base = self
      .client
      .cache()
      .get::<Vec<Property>>(&QueryKey::Properties.cache_key())?
      .map(|entry| entry.data)
      .unwrap_or_default();
    Ok(self.layer().merged(&base))
  }

  pub fn pending(&self) -> usize {
    self.layer().len()
  }
}

fn revalidate_all(client: &QueryClient, api: &PropertyApi) -> crate::query::SharedFetch {
  let api = api.clone();
  client.revalidate(
    &QueryKey::Properties.cache_key(),
    move || async move { api.fetch_all().await },
    true,
  )
}
