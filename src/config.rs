use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::admission::RetryConfig;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub limits: LimitsConfig,
  #[serde(default)]
  pub retry: RetrySettings,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub pagination: PaginationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL, e.g. https://xyz.supabase.co
  pub url: String,
  /// Listings table name
  #[serde(default = "default_table")]
  pub table: String,
  /// Local store key holding owner submissions
  #[serde(default = "default_submissions_key")]
  pub submissions_key: String,
}

fn default_table() -> String {
  "propiedades".to_string()
}

fn default_submissions_key() -> String {
  "owner_submissions".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  #[serde(default = "default_bucket")]
  pub bucket: String,
  /// Cache-Control max-age (seconds) for uploaded objects
  #[serde(default = "default_cache_control")]
  pub cache_control: String,
}

fn default_bucket() -> String {
  "propiedades".to_string()
}

fn default_cache_control() -> String {
  "3600".to_string()
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      bucket: default_bucket(),
      cache_control: default_cache_control(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Age after which cached data triggers a background refresh
  pub ttl_secs: u64,
  /// Window in which identical queries share one fetch
  pub dedup_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 300,
      dedup_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
  pub max_requests: u32,
  pub window_secs: u64,
  pub max_concurrent: usize,
  /// How often expired rate-limit windows are swept
  pub cleanup_secs: u64,
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      max_requests: 100,
      window_secs: 60,
      max_concurrent: 10,
      cleanup_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub max_retries: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      max_retries: 2,
      initial_backoff_ms: 1000,
      max_backoff_ms: 8000,
    }
  }
}

impl From<&RetrySettings> for RetryConfig {
  fn from(s: &RetrySettings) -> Self {
    RetryConfig {
      max_retries: s.max_retries,
      initial_backoff: Duration::from_millis(s.initial_backoff_ms),
      max_backoff: Duration::from_millis(s.max_backoff_ms.max(s.initial_backoff_ms)),
      ..RetryConfig::default()
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  pub poll_interval_secs: u64,
  pub max_reconnects: u32,
  /// Quiet period before a burst of changes revalidates the collection
  pub debounce_ms: u64,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: 5,
      max_reconnects: 5,
      debounce_ms: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
  pub page_size: usize,
}

impl Default for PaginationConfig {
  fn default() -> Self {
    Self { page_size: 20 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./inmo.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/inmo/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(SyncError::Config(
        "No configuration file found. Create one at ~/.config/inmo/config.yaml".to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("inmo.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("inmo").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml_str(&contents).map_err(|e| {
      SyncError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
  }

  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.backend.url.trim().is_empty() {
      return Err(SyncError::Config("backend.url must not be empty".into()));
    }
    if self.limits.max_concurrent == 0 {
      return Err(SyncError::Config("limits.max_concurrent must be at least 1".into()));
    }
    if self.pagination.page_size == 0 {
      return Err(SyncError::Config("pagination.page_size must be at least 1".into()));
    }
    Ok(())
  }

  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.ttl_secs)
  }

  pub fn dedup_window(&self) -> Duration {
    Duration::from_secs(self.cache.dedup_secs)
  }

  pub fn rate_window(&self) -> Duration {
    Duration::from_secs(self.limits.window_secs)
  }

  pub fn retry_config(&self) -> RetryConfig {
    RetryConfig::from(&self.retry)
  }

  /// Backoff policy for realtime reconnects.
  pub fn reconnect_config(&self) -> RetryConfig {
    RetryConfig {
      max_retries: self.realtime.max_reconnects,
      ..self.retry_config()
    }
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.realtime.poll_interval_secs.max(1))
  }

  pub fn realtime_debounce(&self) -> Duration {
    Duration::from_millis(self.realtime.debounce_ms)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks INMO_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("INMO_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        SyncError::Config(
          "API key not found. Set INMO_API_KEY or SUPABASE_ANON_KEY environment variable."
            .to_string(),
        )
      })
  }

  /// Get the sign-in password from the environment.
  pub fn get_password() -> Result<String> {
    std::env::var("INMO_PASSWORD").map_err(|_| {
      SyncError::Config("Password not found. Set INMO_PASSWORD environment variable.".to_string())
    })
  }
}
