//! Trailing-edge debouncing keyed by string.
//!
//! Calls for the same key that arrive within `delay` of each other collapse
//! into one execution of the most recently supplied work. Every caller in the
//! burst receives that execution's outcome. `cancel` rejects the waiting
//! callers with `SyncError::Cancelled` instead of leaving them unsettled.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, SyncError};

type Work<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

struct PendingCall<T> {
  generation: u64,
  work: Option<Work<T>>,
  waiters: Vec<oneshot::Sender<Result<T>>>,
  timer: JoinHandle<()>,
}

pub struct Debouncer<T> {
  pending: Arc<Mutex<HashMap<String, PendingCall<T>>>>,
  next_generation: Arc<Mutex<u64>>,
}

impl<T> Clone for Debouncer<T> {
  fn clone(&self) -> Self {
    Self {
      pending: Arc::clone(&self.pending),
      next_generation: Arc::clone(&self.next_generation),
    }
  }
}

impl<T: Clone + Send + 'static> Default for Debouncer<T> {
  fn default() -> Self {
    Self::new()
  }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Clone + Send + 'static> Debouncer<T> {
  pub fn new() -> Self {
    Self {
      pending: Arc::new(Mutex::new(HashMap::new())),
      next_generation: Arc::new(Mutex::new(0)),
    }
  }

  /// Schedule `work` under `key`, restarting the key's timer.
  pub async fn debounce<F, Fut>(&self, key: &str, work: F, delay: Duration) -> Result<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let work: Work<T> = Box::new(move || Box::pin(work()));

    let generation = {
      let mut next = lock(&self.next_generation);
      *next += 1;
      *next
    };

    {
      let mut pending = lock(&self.pending);
      let timer = self.spawn_timer(key.to_string(), generation, delay);

      match pending.get_mut(key) {
        Some(call) => {
          call.timer.abort();
          call.timer = timer;
          call.generation = generation;
          call.work = Some(work);
          call.waiters.push(tx);
        }
        None => {
          pending.insert(
            key.to_string(),
            PendingCall {
              generation,
              work: Some(work),
              waiters: vec![tx],
              timer,
            },
          );
        }
      }
    }

    rx.await
      .unwrap_or_else(|_| Err(SyncError::Cancelled(format!("debounced call '{}' dropped", key))))
  }

  fn spawn_timer(&self, key: String, generation: u64, delay: Duration) -> JoinHandle<()> {
    let pending = Arc::clone(&self.pending);
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;

      let call = {
        let mut pending = lock(&pending);
        match pending.get(&key) {
          Some(call) if call.generation == generation => pending.remove(&key),
          _ => None,
        }
      };
      let Some(mut call) = call else {
        return;
      };
      let Some(work) = call.work.take() else {
        return;
      };

      debug!(key = %key, waiters = call.waiters.len(), "Running debounced call");
      let outcome = work().await;
      for waiter in call.waiters {
        let _ = waiter.send(outcome.clone());
      }
    })
  }

  /// Drop the pending call for `key`, rejecting everyone waiting on it.
  ///
  /// Returns false if nothing was pending. A call whose timer already fired
  /// is running and cannot be cancelled.
  pub fn cancel(&self, key: &str) -> bool {
    let call = lock(&self.pending).remove(key);
    match call {
      Some(call) => {
        call.timer.abort();
        for waiter in call.waiters {
          let _ = waiter.send(Err(SyncError::Cancelled(format!(
            "debounced call '{}' cancelled",
            key
          ))));
        }
        true
      }
      None => false,
    }
  }

  /// Keys with a timer still running.
  pub fn pending_keys(&self) -> Vec<String> {
    lock(&self.pending).keys().cloned().collect()
  }
}
