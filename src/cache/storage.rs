//! In-memory entry storage for the query cache.
//!
//! Pure bookkeeping: every method takes `now` explicitly so timing decisions
//! are made by the caller and are easy to test.

use color_eyre::Result;
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::CacheOptions;

/// Type-erased fetcher remembered per entry so stale data can be refreshed
/// without the original caller.
pub(crate) type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A single cached value.
pub(crate) struct CacheEntry {
  pub data: Value,
  pub stored_at: Instant,
  pub options: CacheOptions,
  pub fetcher: Option<Fetcher>,
}

impl CacheEntry {
  pub fn new(data: Value, options: CacheOptions, fetcher: Option<Fetcher>, now: Instant) -> Self {
    Self {
      data,
      stored_at: now,
      options,
      fetcher,
    }
  }

  pub fn age(&self, now: Instant) -> Duration {
    now.saturating_duration_since(self.stored_at)
  }

  pub fn is_stale(&self, now: Instant) -> bool {
    self.age(now) > self.options.stale_time
  }

  pub fn is_expired(&self, now: Instant) -> bool {
    self.age(now) > self.options.cache_time
  }
}

/// A stale entry that can be refreshed in the background.
pub(crate) struct StaleEntry {
  pub key: String,
  pub options: CacheOptions,
  pub fetcher: Fetcher,
}

#[derive(Default)]
pub(crate) struct EntryMap {
  entries: HashMap<String, CacheEntry>,
}

impl EntryMap {
  /// Look up a live entry, evicting it first if it has expired.
  pub fn get_live(&mut self, key: &str, now: Instant) -> Option<&mut CacheEntry> {
    if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
      self.entries.remove(key);
      return None;
    }
    self.entries.get_mut(key)
  }

  /// Store data under `key`. A `None` fetcher keeps the one already remembered.
  pub fn store(
    &mut self,
    key: &str,
    data: Value,
    options: CacheOptions,
    fetcher: Option<Fetcher>,
    now: Instant,
  ) {
    let fetcher = fetcher.or_else(|| self.entries.get(key).and_then(|e| e.fetcher.clone()));
    self
      .entries
      .insert(key.to_string(), CacheEntry::new(data, options, fetcher, now));
  }

  pub fn remove(&mut self, key: &str) -> bool {
    self.entries.remove(key).is_some()
  }

  pub fn keys_matching(&self, pattern: &Regex) -> Vec<String> {
    self
      .entries
      .keys()
      .filter(|key| pattern.is_match(key))
      .cloned()
      .collect()
  }

  /// Remove every expired entry, returning the evicted keys.
  pub fn sweep(&mut self, now: Instant) -> Vec<String> {
    let expired: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_expired(now))
      .map(|(key, _)| key.clone())
      .collect();
    for key in &expired {
      self.entries.remove(key);
    }
    expired
  }

  /// Entries past their stale time that remember how to refetch themselves.
  pub fn stale_entries(&self, now: Instant) -> Vec<StaleEntry> {
    self
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_stale(now) && !entry.is_expired(now))
      .filter_map(|(key, entry)| {
        entry.fetcher.as_ref().map(|fetcher| StaleEntry {
          key: key.clone(),
          options: entry.options,
          fetcher: Arc::clone(fetcher),
        })
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;
  use serde_json::json;

  fn options(stale_secs: u64, cache_secs: u64) -> CacheOptions {
    CacheOptions::default()
      .with_stale_time(Duration::from_secs(stale_secs))
      .with_cache_time(Duration::from_secs(cache_secs))
  }

  fn noop_fetcher() -> Fetcher {
    Arc::new(|| async { Ok(json!(null)) }.boxed())
  }

  #[test]
  fn test_entry_staleness_boundaries() {
    let now = Instant::now();
    let entry = CacheEntry::new(json!(1), options(10, 20), None, now);

    assert!(!entry.is_stale(now + Duration::from_secs(10)));
    assert!(entry.is_stale(now + Duration::from_secs(11)));
    assert!(!entry.is_expired(now + Duration::from_secs(20)));
    assert!(entry.is_expired(now + Duration::from_secs(21)));
  }

  #[test]
  fn test_get_live_evicts_expired() {
    let now = Instant::now();
    let mut map = EntryMap::default();
    map.store("a", json!(1), options(1, 2), None, now);

    assert!(map.get_live("a", now + Duration::from_secs(2)).is_some());
    assert!(map.get_live("a", now + Duration::from_secs(3)).is_none());
    assert_eq!(map.len(), 0);
  }

  #[test]
  fn test_store_keeps_existing_fetcher() {
    let now = Instant::now();
    let mut map = EntryMap::default();
    map.store("a", json!(1), options(1, 5), Some(noop_fetcher()), now);
    map.store("a", json!(2), options(1, 5), None, now);

    let later = now + Duration::from_secs(2);
    let stale = map.stale_entries(later);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].key, "a");
  }

  #[test]
  fn test_sweep_removes_only_expired() {
    let now = Instant::now();
    let mut map = EntryMap::default();
    map.store("short", json!(1), options(1, 1), None, now);
    map.store("long", json!(2), options(1, 60), None, now);

    let evicted = map.sweep(now + Duration::from_secs(5));
    assert_eq!(evicted, vec!["short".to_string()]);
    assert_eq!(map.len(), 1);
  }

  #[test]
  fn test_keys_matching() {
    let now = Instant::now();
    let mut map = EntryMap::default();
    map.store("market:42:price", json!(1), options(1, 5), None, now);
    map.store("market:42:depth", json!(2), options(1, 5), None, now);
    map.store("market:7:price", json!(3), options(1, 5), None, now);

    let mut keys = map.keys_matching(&Regex::new(r"^market:42:").unwrap());
    keys.sort();
    assert_eq!(keys, vec!["market:42:depth", "market:42:price"]);
  }

  #[test]
  fn test_stale_entries_skip_entries_without_fetcher() {
    let now = Instant::now();
    let mut map = EntryMap::default();
    map.store("set-only", json!(1), options(1, 60), None, now);
    map.store("queried", json!(2), options(1, 60), Some(noop_fetcher()), now);
    map.store("fresh", json!(3), options(30, 60), Some(noop_fetcher()), now);

    let stale = map.stale_entries(now + Duration::from_secs(5));
    let keys: Vec<&str> = stale.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["queried"]);
  }
}
