//! Sources of change events.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::ChangeEvent;
use crate::backend::{Backend, RowQuery};
use crate::error::Result;

/// A change channel for one table.
#[async_trait]
pub trait ChangeFeed: Send {
  /// Open or reopen the channel.
  async fn connect(&mut self) -> Result<()>;

  /// Wait for the next change. `Ok(None)` means the channel closed and
  /// should be reopened.
  async fn next(&mut self) -> Result<Option<ChangeEvent>>;
}

/// Change feed built by diffing periodic snapshots of a table.
///
/// Used where the backend offers no push channel. Changes between two polls
/// collapse into one event per row.
pub struct PollingFeed {
  backend: Arc<dyn Backend>,
  table: String,
  interval: Duration,
  snapshot: Option<BTreeMap<i64, Value>>,
  queued: VecDeque<ChangeEvent>,
}

impl PollingFeed {
  pub fn new(backend: Arc<dyn Backend>, table: &str, interval: Duration) -> Self {
    Self {
      backend,
      table: table.to_string(),
      interval,
      snapshot: None,
      queued: VecDeque::new(),
    }
  }

  async fn take_snapshot(&self) -> Result<BTreeMap<i64, Value>> {
    let set = self.backend.select(&self.table, &RowQuery::new()).await?;
    Ok(
      set
        .rows
        .into_iter()
        .filter_map(|row| row.get("id").and_then(Value::as_i64).map(|id| (id, row)))
        .collect(),
    )
  }
}

/// Events turning `old` into `new`, in id order.
fn diff(old: &BTreeMap<i64, Value>, new: &BTreeMap<i64, Value>) -> Vec<ChangeEvent> {
  let mut events = Vec::new();
  for (id, row) in new {
    match old.get(id) {
      None => events.push(ChangeEvent::insert(row.clone())),
      Some(previous) if previous != row => {
        events.push(ChangeEvent::update(row.clone(), previous.clone()))
      }
      Some(_) => {}
    }
  }
  for (id, row) in old {
    if !new.contains_key(id) {
      events.push(ChangeEvent::delete(row.clone()));
    }
  }
  events
}

#[async_trait]
impl ChangeFeed for PollingFeed {
  async fn connect(&mut self) -> Result<()> {
    let baseline = self.take_snapshot().await?;
    debug!(table = %self.table, rows = baseline.len(), "Polling feed connected");
    self.snapshot = Some(baseline);
    self.queued.clear();
    Ok(())
  }

  async fn next(&mut self) -> Result<Option<ChangeEvent>> {
    loop {
      if let Some(event) = self.queued.pop_front() {
        return Ok(Some(event));
      }
      let Some(previous) = self.snapshot.as_ref() else {
        return Ok(None);
      };
      let previous = previous.clone();

      tokio::time::sleep(self.interval).await;
      let current = self.take_snapshot().await?;
      let events = diff(&previous, &current);
      trace!(table = %self.table, changes = events.len(), "Polled table");
      self.queued.extend(events);
      self.snapshot = Some(current);
    }
  }
}
