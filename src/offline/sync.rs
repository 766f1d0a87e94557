//! Sync trigger: turns connectivity, focus and background-sync signals into
//! cache revalidation and queue replay.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::queue::{ActionQueue, DrainReport};
use crate::cache::QueryCache;
use crate::listeners::{Listeners, Subscription};

/// Tag the application shell registers for platform background sync.
pub const DEFAULT_SYNC_TAG: &str = "sync-pending-actions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
  /// Background sync tag that triggers a drain
  pub sync_tag: String,
  /// Revalidate and drain when the application regains focus
  pub sync_on_focus: bool,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      sync_tag: DEFAULT_SYNC_TAG.to_string(),
      sync_on_focus: true,
    }
  }
}

/// Coordinates the query cache and the action queue.
///
/// This is the only component that knows about both; they never call each
/// other. Replay is driven by events, never by a timer.
pub struct SyncTrigger {
  cache: QueryCache,
  queue: Arc<ActionQueue>,
  options: SyncOptions,
  online: AtomicBool,
  online_listeners: Listeners<bool>,
}

impl SyncTrigger {
  pub fn new(cache: QueryCache, queue: Arc<ActionQueue>, options: SyncOptions) -> Self {
    Self {
      cache,
      queue,
      options,
      online: AtomicBool::new(true),
      online_listeners: Listeners::new(),
    }
  }

  /// Start from a known connectivity state instead of assuming online.
  pub fn with_initial_online(self, online: bool) -> Self {
    self.online.store(online, Ordering::SeqCst);
    self
  }

  /// Feed a platform connectivity change. Going from offline to online
  /// revalidates stale cache entries and drains the queue.
  pub async fn set_online(&self, online: bool) -> Result<Option<DrainReport>> {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    if was_online == online {
      return Ok(None);
    }

    if online {
      info!("Connectivity restored");
    } else {
      warn!("Connectivity lost; queuing mutations");
    }
    self.online_listeners.emit(&online);

    if online {
      return self.sync("online").await.map(Some);
    }
    Ok(None)
  }

  /// The application came back to the foreground.
  pub async fn visibility_regained(&self) -> Result<Option<DrainReport>> {
    if !self.options.sync_on_focus {
      return Ok(None);
    }
    self.sync("focus").await.map(Some)
  }

  /// A platform background-sync event fired for `tag`.
  pub async fn background_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.options.sync_tag {
      debug!(tag, "Ignoring background sync for unknown tag");
      return Ok(None);
    }
    self.sync("background").await.map(Some)
  }

  /// Drain now regardless of the online indicator.
  pub async fn sync_now(&self) -> Result<DrainReport> {
    self.sync("manual").await
  }

  async fn sync(&self, reason: &'static str) -> Result<DrainReport> {
    match self.cache.revalidate_stale() {
      Ok(count) => debug!(reason, count, "Revalidating stale queries"),
      Err(e) => warn!(reason, error = %e, "Failed to schedule revalidation"),
    }
    let report = self.queue.drain().await?;
    debug!(reason, ?report, "Sync finished");
    Ok(report)
  }

  /// Advisory connectivity flag for UI affordances. Never used to gate replay.
  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  pub fn on_online_change<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&bool) + Send + Sync + 'static,
  {
    self.online_listeners.add(callback)
  }

  /// Number of actions waiting, for a pending-changes badge.
  pub fn pending_count(&self) -> Result<usize> {
    self.queue.pending_count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheOptions;
  use crate::offline::queue::testing::RecordingReplayer;
  use crate::offline::queue::ReplayError;
  use crate::offline::OfflineStore;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::sync::Mutex;
  use std::time::Duration;

  struct Fixture {
    trigger: SyncTrigger,
    queue: Arc<ActionQueue>,
    replayer: Arc<RecordingReplayer>,
    cache: QueryCache,
  }

  fn fixture(options: SyncOptions) -> Fixture {
    let store = Arc::new(OfflineStore::open_in_memory().unwrap());
    let replayer = Arc::new(RecordingReplayer::default());
    let queue = Arc::new(ActionQueue::new(store, replayer.clone()));
    let cache = QueryCache::default();
    let trigger = SyncTrigger::new(cache.clone(), Arc::clone(&queue), options);
    Fixture {
      trigger,
      queue,
      replayer,
      cache,
    }
  }

  #[tokio::test]
  async fn test_offline_enqueue_then_online_replays_in_order() {
    let f = fixture(SyncOptions::default());

    f.trigger.set_online(false).await.unwrap();
    f.queue.enqueue("/api/trade", "POST", &json!({"id": 1})).unwrap();
    f.queue.enqueue("/api/trade", "POST", &json!({"id": 1})).unwrap();
    assert!(f.replayer.endpoints().is_empty());
    assert_eq!(f.trigger.pending_count().unwrap(), 2);

    let report = f.trigger.set_online(true).await.unwrap().unwrap();
    assert_eq!(report.replayed, 2);

    let calls = f.replayer.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].id < calls[1].id);
    assert!(calls.iter().all(|a| a.payload == json!({"id": 1})));
    assert_eq!(f.queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_repeated_online_signal_does_not_drain() {
    let f = fixture(SyncOptions::default());
    f.queue.enqueue("/a", "POST", &1).unwrap();

    // Already online: no transition, no replay.
    assert_eq!(f.trigger.set_online(true).await.unwrap(), None);
    assert!(f.replayer.endpoints().is_empty());
  }

  #[tokio::test]
  async fn test_failed_replay_retried_on_next_transition() {
    let f = fixture(SyncOptions::default());
    f.trigger.set_online(false).await.unwrap();
    f.queue.enqueue("/a", "POST", &1).unwrap();
    f.replayer
      .fail_next("/a", ReplayError::Retryable("timeout".into()));

    let report = f.trigger.set_online(true).await.unwrap().unwrap();
    assert!(report.halted);
    assert_eq!(f.trigger.pending_count().unwrap(), 1);

    f.trigger.set_online(false).await.unwrap();
    let report = f.trigger.set_online(true).await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(f.trigger.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_online_indicator_notifies() {
    let f = fixture(SyncOptions::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
      let seen = Arc::clone(&seen);
      f.trigger.on_online_change(move |online| seen.lock().unwrap().push(*online))
    };

    f.trigger.set_online(false).await.unwrap();
    assert!(!f.trigger.is_online());
    f.trigger.set_online(false).await.unwrap();
    f.trigger.set_online(true).await.unwrap();
    assert!(f.trigger.is_online());

    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
  }

  #[tokio::test]
  async fn test_background_sync_matches_tag() {
    let f = fixture(SyncOptions::default());
    f.queue.enqueue("/a", "POST", &1).unwrap();

    assert_eq!(f.trigger.background_sync("other-tag").await.unwrap(), None);
    assert!(f.replayer.endpoints().is_empty());

    let report = f
      .trigger
      .background_sync(DEFAULT_SYNC_TAG)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report.replayed, 1);
  }

  #[tokio::test]
  async fn test_focus_sync_can_be_disabled() {
    let f = fixture(SyncOptions {
      sync_on_focus: false,
      ..SyncOptions::default()
    });
    f.queue.enqueue("/a", "POST", &1).unwrap();
    assert_eq!(f.trigger.visibility_regained().await.unwrap(), None);
    assert!(f.replayer.endpoints().is_empty());

    let f = fixture(SyncOptions::default());
    f.queue.enqueue("/a", "POST", &1).unwrap();
    let report = f.trigger.visibility_regained().await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
  }

  #[tokio::test]
  async fn test_drain_not_gated_by_online_flag() {
    let f = fixture(SyncOptions::default());
    let trigger = f.trigger.with_initial_online(false);
    f.queue.enqueue("/a", "POST", &1).unwrap();

    // A stale "offline" flag must not block an explicit sync.
    let report = trigger.sync_now().await.unwrap();
    assert_eq!(report.replayed, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_revalidates_stale_queries() {
    let f = fixture(SyncOptions::default());
    let fetches = Arc::new(AtomicU32::new(0));
    let options = CacheOptions::default()
      .with_stale_time(Duration::from_secs(1))
      .with_cache_time(Duration::from_secs(60));
    {
      let fetches = Arc::clone(&fetches);
      f.cache
        .query_with(
          "portfolio",
          move || {
            let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n) }
          },
          options,
        )
        .await
        .unwrap();
    }

    f.trigger.set_online(false).await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    f.trigger.set_online(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(f.cache.get::<u32>("portfolio").unwrap(), Some(2));
  }
}
