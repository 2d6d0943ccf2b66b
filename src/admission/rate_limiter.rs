//! Fixed-window rate limiting per request key.
//!
//! Windows do not slide: a burst straddling a window boundary can admit up to
//! twice `max_requests` across the two adjacent windows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Request count for one key within its current window.
#[derive(Debug, Clone, Copy)]
struct RateLimitRecord {
  count: u32,
  reset_time: Instant,
}

pub struct RateLimiter {
  records: Mutex<HashMap<String, RateLimitRecord>>,
  max_requests: u32,
  window: Duration,
}

impl Default for RateLimiter {
  /// 100 requests per 60-second window.
  fn default() -> Self {
    Self::new(100, Duration::from_secs(60))
  }
}

impl RateLimiter {
  pub fn new(max_requests: u32, window: Duration) -> Self {
    Self {
      records: Mutex::new(HashMap::new()),
      max_requests,
      window,
    }
  }

  fn records(&self) -> MutexGuard<'_, HashMap<String, RateLimitRecord>> {
    // The map holds plain counters, a poisoned guard is still consistent.
    self.records.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Count a request against `key` and report whether it may proceed.
  pub fn is_allowed(&self, key: &str) -> bool {
    let now = Instant::now();
    let mut records = self.records();

    match records.get_mut(key) {
      Some(record) if now <= record.reset_time => {
        record.count += 1;
        record.count <= self.max_requests
      }
      _ => {
        records.insert(
          key.to_string(),
          RateLimitRecord {
            count: 1,
            reset_time: now + self.window,
          },
        );
        self.max_requests >= 1
      }
    }
  }

  /// Like `is_allowed`, but a rejection becomes `SyncError::RateLimited`.
  pub fn check(&self, key: &str) -> Result<()> {
    if self.is_allowed(key) {
      return Ok(());
    }

    let retry_after = self.retry_after(key).unwrap_or(self.window);
    debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Request rate limited");
    Err(SyncError::RateLimited {
      key: key.to_string(),
      retry_after,
    })
  }

  /// Time until the window for `key` resets, if the key is currently exhausted.
  pub fn retry_after(&self, key: &str) -> Option<Duration> {
    let now = Instant::now();
    let records = self.records();
    let record = records.get(key)?;

    if record.count > self.max_requests && now <= record.reset_time {
      Some(record.reset_time - now)
    } else {
      None
    }
  }

  /// Drop records whose window has expired. Returns how many were removed.
  pub fn cleanup(&self) -> usize {
    let now = Instant::now();
    let mut records = self.records();
    let before = records.len();
    records.retain(|_, record| now <= record.reset_time);
    before - records.len()
  }

  /// Number of keys currently tracked.
  pub fn tracked_keys(&self) -> usize {
    self.records().len()
  }

  /// Sweep expired records every `period` until the handle is aborted.
  pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
    let limiter = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let removed = limiter.cleanup();
        if removed > 0 {
          debug!(removed, "Swept expired rate limit windows");
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_window_admits_max_then_rejects_then_resets() {
    let limiter = RateLimiter::new(3, Duration::from_millis(1000));

    assert!(limiter.is_allowed("k"));
    assert!(limiter.is_allowed("k"));
    assert!(limiter.is_allowed("k"));
    assert!(!limiter.is_allowed("k"));

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert!(limiter.is_allowed("k"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_keys_are_independent() {
    let limiter = RateLimiter::new(1, Duration::from_secs(60));

    assert!(limiter.is_allowed("properties"));
    assert!(!limiter.is_allowed("properties"));
    assert!(limiter.is_allowed("property:7"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_check_reports_retry_after() {
    let limiter = RateLimiter::new(1, Duration::from_secs(10));
    limiter.check("k").unwrap();

    tokio::time::advance(Duration::from_secs(4)).await;
    match limiter.check("k") {
      Err(SyncError::RateLimited { key, retry_after }) => {
        assert_eq!(key, "k");
        assert_eq!(retry_after, Duration::from_secs(6));
      }
      other => panic!("expected rate limit, got {:?}", other),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_cleanup_drops_expired_windows() {
    let limiter = RateLimiter::new(5, Duration::from_secs(1));
    limiter.is_allowed("a");
    limiter.is_allowed("b");

    tokio::time::advance(Duration::from_millis(500)).await;
    limiter.is_allowed("c");
    tokio::time::advance(Duration::from_millis(600)).await;

    assert_eq!(limiter.cleanup(), 2);
    assert_eq!(limiter.tracked_keys(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_background_sweeper() {
    let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(1)));
    limiter.is_allowed("a");
    let handle = limiter.spawn_cleanup(Duration::from_secs(2));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(limiter.tracked_keys(), 0);
    handle.abort();
  }
}
