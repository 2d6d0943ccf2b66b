//! Retry with exponential backoff for backend calls.
//!
//! Retries are invisible to callers: they await one future that resolves with
//! the first success or the last error once attempts are exhausted.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy shared by data access calls and realtime reconnects.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  /// Retries after the first attempt
  pub max_retries: u32,

  /// Delay before the first retry
  pub initial_backoff: Duration,

  /// Upper bound for any single delay
  pub max_backoff: Duration,

  /// Backoff multiplier (1.0 gives a fixed delay)
  pub multiplier: f64,

  /// Add up to 25% random jitter to each delay
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 2,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(8),
      multiplier: 2.0,
      jitter: true,
    }
  }
}

impl RetryConfig {
  /// Fixed delay between attempts, no jitter.
  pub fn fixed(max_retries: u32, delay: Duration) -> Self {
    Self {
      max_retries,
      initial_backoff: delay,
      max_backoff: delay,
      multiplier: 1.0,
      jitter: false,
    }
  }

  /// No retries at all.
  pub fn none() -> Self {
    Self::fixed(0, Duration::ZERO)
  }

  /// Delay before retry number `attempt + 1`: `initial * multiplier^attempt`,
  /// capped at `max_backoff`, then stretched by jitter when enabled.
  pub fn backoff_duration(&self, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = (self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent))
      .min(self.max_backoff.as_secs_f64());

    if self.jitter {
      Duration::from_secs_f64(secs * rand::thread_rng().gen_range(1.0..1.25))
    } else {
      Duration::from_secs_f64(secs)
    }
  }
}

/// What a failed backend call should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  /// Back off per the config and try again
  Retry,
  /// Wait this long instead of the computed backoff; capped at `max_backoff`
  RetryAfter(Duration),
  /// Permanent failures: validation, auth, rate limiting, other 4xx
  NoRetry,
}

/// Errors that know whether the call that produced them is worth repeating.
pub trait RetryableError {
  fn retry_decision(&self) -> RetryDecision;
}

/// Run `call` until it succeeds, returns a non-retryable error, or
/// `config.max_retries` retries are spent. `label` names the call in logs.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, label: &str, mut call: F) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: RetryableError + std::fmt::Display,
{
  let mut attempt = 0;

  loop {
    let e = match call().await {
      Ok(value) => return Ok(value),
      Err(e) => e,
    };

    let backoff = match e.retry_decision() {
      RetryDecision::NoRetry => {
        debug!(call = label, attempt, error = %e, "Backend call failed, not retrying");
        return Err(e);
      }
      _ if attempt >= config.max_retries => {
        warn!(call = label, attempts = attempt + 1, error = %e, "Backend call failed, retries exhausted");
        return Err(e);
      }
      RetryDecision::RetryAfter(wait) => wait.min(config.max_backoff),
      RetryDecision::Retry => config.backoff_duration(attempt),
    };

    warn!(
      call = label,
      attempt = attempt + 1,
      max_attempts = config.max_retries + 1,
      backoff_ms = backoff.as_millis() as u64,
      error = %e,
      "Backend call failed, retrying"
    );
    sleep(backoff).await;
    attempt += 1;
  }
}
