//! Bounded-concurrency request queue.
//!
//! At most `max_concurrent` units of work run at once. Waiting work is
//! admitted in the order it was added; the semaphore hands out permits FIFO.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Result, SyncError};

#[derive(Clone)]
pub struct RequestQueue {
  permits: Arc<Semaphore>,
  max_concurrent: usize,
  waiting: Arc<AtomicUsize>,
}

impl Default for RequestQueue {
  fn default() -> Self {
    Self::new(10)
  }
}

impl RequestQueue {
  pub fn new(max_concurrent: usize) -> Self {
    let max_concurrent = max_concurrent.max(1);
    Self {
      permits: Arc::new(Semaphore::new(max_concurrent)),
      max_concurrent,
      waiting: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Run `work` once a slot is free.
  ///
  /// The slot is released when the work finishes, fails or is dropped, so one
  /// failing unit never holds up the rest of the queue.
  pub async fn add<F, Fut, T>(&self, work: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.waiting.fetch_add(1, Ordering::SeqCst);
    let permit = self.permits.acquire().await;
    self.waiting.fetch_sub(1, Ordering::SeqCst);

    let _permit = permit.map_err(|_| SyncError::Task("request queue closed".into()))?;
    work().await
  }

  /// Units of work currently executing.
  pub fn running(&self) -> usize {
    self.max_concurrent - self.permits.available_permits()
  }

  /// Units of work waiting for a slot.
  pub fn pending(&self) -> usize {
    self.waiting.load(Ordering::SeqCst)
  }

  pub fn max_concurrent(&self) -> usize {
    self.max_concurrent
  }
}
