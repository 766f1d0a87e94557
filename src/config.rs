use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::offline::{SyncOptions, DEFAULT_CACHED_DATA_MAX_AGE, DEFAULT_SYNC_TAG};
use crate::stream::{ReconnectPolicy, StreamOptions};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub stream: StreamConfig,
  pub cache: CacheConfig,
  pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  /// WebSocket endpoint, e.g. "wss://stream.example.com/ws"
  pub url: Option<String>,
  pub reconnect_base_ms: u64,
  pub reconnect_max_ms: u64,
  /// Give up after this many consecutive failures (unset = never)
  pub max_reconnect_attempts: Option<u32>,
  /// Random extra delay added to each backoff step
  pub jitter_ms: u64,
  pub heartbeat_interval_ms: u64,
  pub heartbeat_timeout_ms: u64,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      url: None,
      reconnect_base_ms: 1_000,
      reconnect_max_ms: 30_000,
      max_reconnect_attempts: None,
      jitter_ms: 0,
      heartbeat_interval_ms: 5_000,
      heartbeat_timeout_ms: 10_000,
    }
  }
}

impl StreamConfig {
  pub fn options(&self) -> StreamOptions {
    StreamOptions {
      reconnect: ReconnectPolicy {
        base_delay: Duration::from_millis(self.reconnect_base_ms),
        max_delay: Duration::from_millis(self.reconnect_max_ms),
        max_attempts: self.max_reconnect_attempts,
        jitter: Duration::from_millis(self.jitter_ms),
      },
      heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
      heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_secs: u64,
  pub cache_time_secs: u64,
  pub gc_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      cache_time_secs: 1_800,
      gc_interval_secs: 60,
    }
  }
}

impl CacheConfig {
  pub fn options(&self) -> CacheOptions {
    CacheOptions::default()
      .with_stale_time(Duration::from_secs(self.stale_time_secs))
      .with_cache_time(Duration::from_secs(self.cache_time_secs))
  }

  pub fn gc_interval(&self) -> Duration {
    Duration::from_secs(self.gc_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// SQLite file for the action queue (defaults to the data directory)
  pub database: Option<PathBuf>,
  /// Base URL queued actions are replayed against
  pub replay_base_url: Option<String>,
  pub cached_data_max_age_secs: u64,
  pub sync_tag: String,
  pub revalidate_on_focus: bool,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      database: None,
      replay_base_url: None,
      cached_data_max_age_secs: DEFAULT_CACHED_DATA_MAX_AGE.as_secs(),
      sync_tag: DEFAULT_SYNC_TAG.to_string(),
      revalidate_on_focus: true,
    }
  }
}

impl OfflineConfig {
  pub fn sync_options(&self) -> SyncOptions {
    SyncOptions {
      sync_tag: self.sync_tag.clone(),
      sync_on_focus: self.revalidate_on_focus,
    }
  }

  pub fn cached_data_max_age(&self) -> Duration {
    Duration::from_secs(self.cached_data_max_age_secs)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("offline.db")),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tether.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tether/config.yaml
  ///
  /// With no file anywhere, every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tether.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tether").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    self.cache.options().validate()?;

    let stream = &self.stream;
    if stream.reconnect_base_ms == 0 {
      return Err(eyre!("stream.reconnect_base_ms must be greater than zero"));
    }
    if stream.reconnect_max_ms < stream.reconnect_base_ms {
      return Err(eyre!(
        "stream.reconnect_max_ms ({}) is below stream.reconnect_base_ms ({})",
        stream.reconnect_max_ms,
        stream.reconnect_base_ms
      ));
    }
    if stream.heartbeat_interval_ms == 0 || stream.heartbeat_timeout_ms == 0 {
      return Err(eyre!("stream heartbeat interval and timeout must be greater than zero"));
    }
    if self.cache.gc_interval_secs == 0 {
      return Err(eyre!("cache.gc_interval_secs must be greater than zero"));
    }
    if self.offline.sync_tag.trim().is_empty() {
      return Err(eyre!("offline.sync_tag must not be empty"));
    }
    Ok(())
  }

  /// Get the replay API token from the environment, if one is set.
  ///
  /// Checks TETHER_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("TETHER_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

/// Directory for the offline database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let base = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(base.join("tether"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.stream.reconnect_base_ms, 1_000);
    assert_eq!(config.cache.stale_time_secs, 300);
    assert_eq!(config.offline.sync_tag, DEFAULT_SYNC_TAG);
    assert!(config.offline.revalidate_on_focus);
  }

  #[test]
  fn test_partial_sections() {
    let yaml = r#"
stream:
  url: wss://stream.example.com/ws
  max_reconnect_attempts: 8
  jitter_ms: 250
offline:
  replay_base_url: https://api.example.com
  revalidate_on_focus: false
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.stream.url.as_deref(), Some("wss://stream.example.com/ws"));
    assert_eq!(config.stream.heartbeat_timeout_ms, 10_000);

    let options = config.stream.options();
    assert_eq!(options.reconnect.max_attempts, Some(8));
    assert_eq!(options.reconnect.jitter, Duration::from_millis(250));
    assert_eq!(options.heartbeat_interval, Duration::from_secs(5));

    assert!(!config.offline.sync_options().sync_on_focus);
    assert_eq!(config.offline.cached_data_max_age(), DEFAULT_CACHED_DATA_MAX_AGE);
  }

  #[test]
  fn test_stale_time_above_cache_time_rejected() {
    let yaml = "cache:\n  stale_time_secs: 600\n  cache_time_secs: 60\n";
    let err = Config::parse(yaml).unwrap_err();
    assert!(err.to_string().contains("stale_time"));
  }

  #[test]
  fn test_backoff_bounds_validated() {
    let yaml = "stream:\n  reconnect_base_ms: 5000\n  reconnect_max_ms: 1000\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_load_from_path_and_missing_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.yaml");
    std::fs::write(&path, "cache:\n  gc_interval_secs: 5\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache.gc_interval(), Duration::from_secs(5));

    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }

  #[test]
  fn test_database_path_override() {
    let config = Config::parse("offline:\n  database: /tmp/queue.db\n").unwrap();
    assert_eq!(
      config.offline.database_path().unwrap(),
      PathBuf::from("/tmp/queue.db")
    );
  }
}
