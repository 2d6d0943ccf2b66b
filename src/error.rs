//! Error types for the sync layer.
//!
//! `SyncError` is `Clone` so a single outcome can be handed to every caller
//! that shares a deduplicated fetch or a debounced call. Foreign errors are
//! converted to their message when they enter the crate.

use std::time::Duration;
use thiserror::Error;

use crate::admission::retry::{RetryDecision, RetryableError};

/// Result type alias for sync layer operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
  /// Connection failures, timeouts, dropped responses
  #[error("Network error: {0}")]
  Network(String),

  /// Non-success status returned by the backend
  #[error("Backend error ({status}): {message}")]
  Backend { status: u16, message: String },

  /// Rejected by the client-side rate limiter or by the backend (429)
  #[error("Rate limited on '{key}', retry after {}ms", retry_after.as_millis())]
  RateLimited { key: String, retry_after: Duration },

  /// Input rejected before any network call
  #[error("Validation error: {0}")]
  Validation(String),

  /// Login failed. The underlying reason is logged, never shown.
  #[error("Invalid credentials")]
  InvalidCredentials,

  /// Missing or expired session
  #[error("Unauthorized: {0}")]
  Unauthorized(String),

  #[error("Not found: {0}")]
  NotFound(String),

  /// Local key-value store failures
  #[error("Storage error: {0}")]
  Storage(String),

  /// Object storage upload failures
  #[error("Upload of '{path}' failed: {message}")]
  Upload { path: String, message: String },

  /// Payload could not be decoded into the expected shape
  #[error("Decode error: {0}")]
  Decode(String),

  #[error("Configuration error: {0}")]
  Config(String),

  /// A debounced call was cancelled before it ran
  #[error("Cancelled: {0}")]
  Cancelled(String),

  /// A spawned task panicked or was aborted
  #[error("Task failed: {0}")]
  Task(String),
}

impl SyncError {
  /// Whether this error is worth another attempt.
  pub fn is_transient(&self) -> bool {
    match self {
      SyncError::Network(_) => true,
      SyncError::Backend { status, .. } => *status >= 500,
      _ => false,
    }
  }
}

impl RetryableError for SyncError {
  fn retry_decision(&self) -> RetryDecision {
    if self.is_transient() {
      RetryDecision::Retry
    } else {
      RetryDecision::NoRetry
    }
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    match e.status() {
      Some(status) => SyncError::Backend {
        status: status.as_u16(),
        message: e.to_string(),
      },
      None if e.is_decode() => SyncError::Decode(e.to_string()),
      None => SyncError::Network(e.to_string()),
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Decode(e.to_string())
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::Storage(e.to_string())
  }
}

impl From<std::io::Error> for SyncError {
  fn from(e: std::io::Error) -> Self {
    SyncError::Storage(e.to_string())
  }
}

impl From<base64::DecodeError> for SyncError {
  fn from(e: base64::DecodeError) -> Self {
    SyncError::Decode(format!("invalid base64 payload: {}", e))
  }
}

impl From<tokio::task::JoinError> for SyncError {
  fn from(e: tokio::task::JoinError) -> Self {
    SyncError::Task(e.to_string())
  }
}
