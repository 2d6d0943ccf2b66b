//! Logging configuration using tracing
//!
//! Logs go to a daily rolling file under the data directory. With `verbose`
//! they are mirrored to stderr as well. `RUST_LOG` overrides the level.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SyncError};

/// Default log directory: `$XDG_DATA_HOME/inmo/logs`.
pub fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| SyncError::Config("Could not determine data directory".into()))?;

  Ok(data_dir.join("inmo").join("logs"))
}

/// Initialize the tracing subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)?;

  let default_level = if verbose { "info" } else { "warn" };
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let file_appender = tracing_appender::rolling::daily(log_dir, "inmo.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .compact()
  });

  tracing_subscriber::registry()
    .with(env_filter)
    .with(
      fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true),
    )
    .with(stderr_layer)
    .try_init()
    .map_err(|e| SyncError::Config(format!("Failed to initialize tracing: {}", e)))?;

  Ok(guard)
}
