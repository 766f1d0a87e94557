//! Stale-while-revalidate query cache.

use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::storage::{EntryMap, Fetcher};
use super::traits::{CacheChange, CacheOptions, CacheResult};
use crate::listeners::{Listeners, Subscription};

/// Default period of the background garbage collector.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory cache that serves data immediately and refreshes it in the
/// background once it goes stale.
///
/// Cloning is cheap and shares the same store. Call [`QueryCache::start`] to
/// run periodic garbage collection and [`QueryCache::dispose`] to stop all
/// background work.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

struct Inner {
  entries: Mutex<EntryMap>,
  listeners: Mutex<HashMap<String, Listeners<CacheChange>>>,
  /// In-flight background refetches, at most one per key
  revalidating: Mutex<HashMap<String, JoinHandle<()>>>,
  gc_task: Mutex<Option<JoinHandle<()>>>,
  defaults: CacheOptions,
  gc_interval: Duration,
}

impl QueryCache {
  /// Create a cache with the given default options and GC period.
  pub fn new(defaults: CacheOptions, gc_interval: Duration) -> Result<Self> {
    defaults.validate()?;
    Ok(Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(EntryMap::default()),
        listeners: Mutex::new(HashMap::new()),
        revalidating: Mutex::new(HashMap::new()),
        gc_task: Mutex::new(None),
        defaults,
        gc_interval,
      }),
    })
  }

  /// Start periodic garbage collection. Calling it twice is a no-op.
  pub fn start(&self) -> Result<()> {
    let mut gc_task = lock(&self.inner.gc_task)?;
    if gc_task.as_ref().is_some_and(|h| !h.is_finished()) {
      return Ok(());
    }

    let period = self.inner.gc_interval;
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    *gc_task = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        if let Err(e) = inner.collect_garbage() {
          warn!(error = %e, "Cache garbage collection failed");
        }
      }
    }));

    debug!(interval = ?period, "Cache garbage collector started");
    Ok(())
  }

  /// Stop garbage collection, abort in-flight refreshes and drop all entries
  /// and subscribers.
  pub fn dispose(&self) -> Result<()> {
    if let Some(handle) = lock(&self.inner.gc_task)?.take() {
      handle.abort();
    }
    for (_, handle) in lock(&self.inner.revalidating)?.drain() {
      handle.abort();
    }
    lock(&self.inner.entries)?.clear();
    lock(&self.inner.listeners)?.clear();
    debug!("Cache disposed");
    Ok(())
  }

  /// Fetch with stale-while-revalidate using the cache's default options.
  pub async fn query<T, F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.query_with(key, fetcher, self.inner.defaults).await
  }

  /// Fetch with stale-while-revalidate.
  ///
  /// 1. Fresh entry: returned as is, `fetcher` is not called
  /// 2. Stale entry: returned as is, `fetcher` runs in the background and
  ///    subscribers are notified when it succeeds
  /// 3. No entry: `fetcher` is awaited, its error propagates
  pub async fn query_with<T, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: CacheOptions,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    options.validate()?;

    let fetch = Arc::new(fetcher);
    let erased: Fetcher = {
      let fetch = Arc::clone(&fetch);
      Arc::new(move || {
        let pending = fetch();
        async move {
          let data = pending.await?;
          serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize fetched data: {}", e))
        }
        .boxed()
      })
    };

    let now = Instant::now();
    let cached = {
      let mut entries = lock(&self.inner.entries)?;
      entries.get_live(key, now).map(|entry| {
        entry.fetcher = Some(Arc::clone(&erased));
        (entry.data.clone(), entry.age(now), entry.is_stale(now))
      })
    };

    if let Some((data, age, is_stale)) = cached {
      let data: T = decode(key, data)?;
      if is_stale {
        self.inner.spawn_revalidation(key.to_string(), erased, options)?;
      }
      return Ok(CacheResult::from_cache(data, age, is_stale));
    }

    // No cache, must fetch
    let data = fetch().await?;
    let value =
      serde_json::to_value(&data).map_err(|e| eyre!("Failed to serialize fetched data: {}", e))?;
    self.inner.store(key, value, options, Some(erased))?;
    Ok(CacheResult::from_network(data))
  }

  /// Read an entry without fetching. Expired entries are evicted and read as
  /// absent.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let data = lock(&self.inner.entries)?
      .get_live(key, Instant::now())
      .map(|entry| entry.data.clone());
    data.map(|data| decode(key, data)).transpose()
  }

  /// Store `data` under `key` with the default options.
  pub fn set<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
    self.set_with(key, data, self.inner.defaults)
  }

  /// Store `data` under `key`, resetting its staleness window.
  pub fn set_with<T: Serialize>(&self, key: &str, data: &T, options: CacheOptions) -> Result<()> {
    options.validate()?;
    let value =
      serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize '{}': {}", key, e))?;
    self.inner.store(key, value, options, None)
  }

  /// Remove entries so the next query fetches again. Returns how many
  /// entries were removed.
  pub fn invalidate<I, K>(&self, keys: I) -> Result<usize>
  where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
  {
    let mut removed = 0;
    for key in keys {
      if self.inner.remove(key.as_ref())? {
        removed += 1;
      }
    }
    Ok(removed)
  }

  /// Remove every entry whose key matches `pattern`.
  pub fn invalidate_pattern(&self, pattern: &Regex) -> Result<usize> {
    let keys = lock(&self.inner.entries)?.keys_matching(pattern);
    debug!(pattern = %pattern, matched = keys.len(), "Invalidating by pattern");
    self.invalidate(keys)
  }

  /// Register for change notifications on `key`.
  pub fn subscribe<F>(&self, key: &str, callback: F) -> Result<Subscription>
  where
    F: Fn(&CacheChange) + Send + Sync + 'static,
  {
    let mut listeners = lock(&self.inner.listeners)?;
    // Drop keys whose subscribers have all gone away.
    listeners.retain(|_, l| !l.is_empty());
    Ok(listeners.entry(key.to_string()).or_default().add(callback))
  }

  /// Schedule a background refresh for every stale entry that was loaded
  /// through [`QueryCache::query`]. Returns how many refreshes were started.
  pub fn revalidate_stale(&self) -> Result<usize> {
    let stale = lock(&self.inner.entries)?.stale_entries(Instant::now());
    let mut started = 0;
    for entry in stale {
      if self
        .inner
        .spawn_revalidation(entry.key, entry.fetcher, entry.options)?
      {
        started += 1;
      }
    }
    debug!(started, "Revalidating stale cache entries");
    Ok(started)
  }

  /// Run one garbage collection sweep now.
  pub fn collect_garbage(&self) -> Result<usize> {
    self.inner.collect_garbage()
  }

  /// Number of entries currently held, including expired ones not yet swept.
  pub fn len(&self) -> Result<usize> {
    Ok(lock(&self.inner.entries)?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(EntryMap::default()),
        listeners: Mutex::new(HashMap::new()),
        revalidating: Mutex::new(HashMap::new()),
        gc_task: Mutex::new(None),
        defaults: CacheOptions::default(),
        gc_interval: DEFAULT_GC_INTERVAL,
      }),
    }
  }
}

impl Inner {
  fn store(
    &self,
    key: &str,
    data: Value,
    options: CacheOptions,
    fetcher: Option<Fetcher>,
  ) -> Result<()> {
    lock(&self.entries)?.store(key, data.clone(), options, fetcher, Instant::now());
    self.notify(&CacheChange::Updated {
      key: key.to_string(),
      data,
    })
  }

  fn remove(&self, key: &str) -> Result<bool> {
    // A refetch started before the invalidation must not resurrect the entry.
    if let Some(handle) = lock(&self.revalidating)?.remove(key) {
      handle.abort();
    }
    let removed = lock(&self.entries)?.remove(key);
    if removed {
      self.notify(&CacheChange::Invalidated {
        key: key.to_string(),
      })?;
    }
    Ok(removed)
  }

  fn notify(&self, change: &CacheChange) -> Result<()> {
    let listeners = {
      let mut all = lock(&self.listeners)?;
      if all.get(change.key()).is_some_and(|l| l.is_empty()) {
        all.remove(change.key());
      }
      all.get(change.key()).cloned()
    };
    if let Some(listeners) = listeners {
      listeners.emit(change);
    }
    Ok(())
  }

  /// Start a background refetch unless one is already running for `key`.
  fn spawn_revalidation(
    self: &Arc<Self>,
    key: String,
    fetcher: Fetcher,
    options: CacheOptions,
  ) -> Result<bool> {
    let mut running = lock(&self.revalidating)?;
    if running.get(&key).is_some_and(|h| !h.is_finished()) {
      debug!(key = %key, "Revalidation already in flight");
      return Ok(false);
    }

    let weak = Arc::downgrade(self);
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      let result = fetcher().await;
      let Some(inner) = weak.upgrade() else {
        return;
      };
      match result {
        Ok(value) => {
          debug!(key = %task_key, "Background revalidation succeeded");
          if let Err(e) = inner.store(&task_key, value, options, None) {
            warn!(key = %task_key, error = %e, "Failed to store revalidated data");
          }
        }
        Err(e) => {
          warn!(key = %task_key, error = %e, "Background revalidation failed; serving stale data");
        }
      }
    });
    running.insert(key, handle);
    Ok(true)
  }

  fn collect_garbage(&self) -> Result<usize> {
    let evicted = lock(&self.entries)?.sweep(Instant::now());
    lock(&self.revalidating)?.retain(|_, handle| !handle.is_finished());
    if !evicted.is_empty() {
      debug!(count = evicted.len(), "Evicted expired cache entries");
    }
    Ok(evicted.len())
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    if let Ok(mut gc_task) = self.gc_task.lock() {
      if let Some(handle) = gc_task.take() {
        handle.abort();
      }
    }
    if let Ok(mut running) = self.revalidating.lock() {
      for (_, handle) in running.drain() {
        handle.abort();
      }
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  mutex.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

fn decode<T: DeserializeOwned>(key: &str, data: Value) -> Result<T> {
  serde_json::from_value(data).map_err(|e| eyre!("Failed to decode cached value for '{}': {}", key, e))
}
