//! Core types for the query cache.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// How long data stays fresh when the caller does not say otherwise.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// How long data stays servable when the caller does not say otherwise.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(30 * 60);

/// Per-entry timing policy.
///
/// `stale_time` is how long data is served without a background refresh.
/// `cache_time` is how long it is held at all; past that it is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
  pub stale_time: Duration,
  pub cache_time: Duration,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      stale_time: DEFAULT_STALE_TIME,
      cache_time: DEFAULT_CACHE_TIME,
    }
  }
}

impl CacheOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
    self.cache_time = cache_time;
    self
  }

  /// Reject options where data would be evicted before it goes stale.
  pub fn validate(&self) -> Result<()> {
    if self.stale_time > self.cache_time {
      return Err(eyre!(
        "Invalid cache options: stale_time ({:?}) exceeds cache_time ({:?})",
        self.stale_time,
        self.cache_time
      ));
    }
    Ok(())
  }
}

/// Result from a cache query, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Time since the data was stored (zero for network results)
  pub age: Duration,
}

impl<T> CacheResult<T> {
  pub(crate) fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      age: Duration::ZERO,
    }
  }

  pub(crate) fn from_cache(data: T, age: Duration, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::Stale
      } else {
        CacheSource::Fresh
      },
      age,
    }
  }
}

/// Indicates where query data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched on a cache miss
  Network,
  /// Served from cache, still fresh
  Fresh,
  /// Served from cache past its stale time; a background refresh was scheduled
  Stale,
}

/// Change notification delivered to key subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
  /// The entry was created or replaced.
  Updated { key: String, data: Value },
  /// The entry was removed by the caller.
  Invalidated { key: String },
}

impl CacheChange {
  pub fn key(&self) -> &str {
    match self {
      Self::Updated { key, .. } | Self::Invalidated { key } => key,
    }
  }

  /// Decode the new value of an `Updated` change.
  pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
    match self {
      Self::Updated { data, .. } => serde_json::from_value(data.clone()).ok(),
      Self::Invalidated { .. } => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_default_options_are_valid() {
    let options = CacheOptions::default();
    assert_eq!(options.stale_time, Duration::from_secs(300));
    assert_eq!(options.cache_time, Duration::from_secs(1800));
    assert!(options.validate().is_ok());
  }

  #[test]
  fn test_stale_longer_than_cache_is_rejected() {
    let options = CacheOptions::default()
      .with_stale_time(Duration::from_secs(60))
      .with_cache_time(Duration::from_secs(30));
    let err = options.validate().unwrap_err();
    assert!(err.to_string().contains("stale_time"));
  }

  #[test]
  fn test_equal_stale_and_cache_time_is_allowed() {
    let options = CacheOptions::default()
      .with_stale_time(Duration::from_secs(30))
      .with_cache_time(Duration::from_secs(30));
    assert!(options.validate().is_ok());
  }

  #[test]
  fn test_change_decode() {
    let change = CacheChange::Updated {
      key: "price:AAPL".to_string(),
      data: json!(187.5),
    };
    assert_eq!(change.key(), "price:AAPL");
    assert_eq!(change.decode::<f64>(), Some(187.5));

    let gone = CacheChange::Invalidated {
      key: "price:AAPL".to_string(),
    };
    assert_eq!(gone.decode::<f64>(), None);
  }
}
