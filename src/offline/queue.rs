//! Durable action queue with ordered, at-least-once replay.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::store::{OfflineStore, PendingAction, RejectedAction};

/// Why a replay attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
  /// Worth retrying later: network failure, timeout, server overload
  #[error("replay failed, will retry: {0}")]
  Retryable(String),
  /// The server will never accept this action as sent
  #[error("replay rejected: {0}")]
  Rejected(String),
}

/// Sends a queued action to the server.
pub trait Replayer: Send + Sync {
  fn replay<'a>(&'a self, action: &'a PendingAction) -> BoxFuture<'a, Result<(), ReplayError>>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Actions confirmed and removed
  pub replayed: usize,
  /// Actions parked as permanently rejected
  pub rejected: usize,
  /// Actions still queued when the pass ended
  pub remaining: usize,
  /// Whether the pass stopped early on a retryable failure
  pub halted: bool,
}

/// Captures mutating requests while offline and replays them in order.
///
/// Each entry is deleted only after the server confirms it, so a crash
/// between the server's acknowledgment and the local delete replays the
/// entry again. Endpoints fed by this queue must tolerate duplicates.
pub struct ActionQueue {
  store: Arc<OfflineStore>,
  replayer: Arc<dyn Replayer>,
  /// Serializes drain passes so no action is sent twice concurrently
  draining: AsyncMutex<()>,
}

impl ActionQueue {
  pub fn new(store: Arc<OfflineStore>, replayer: Arc<dyn Replayer>) -> Self {
    Self {
      store,
      replayer,
      draining: AsyncMutex::new(()),
    }
  }

  /// Persist an action for later replay. Returns once it is stored; never
  /// touches the network.
  pub fn enqueue<T: Serialize>(
    &self,
    endpoint: &str,
    method: &str,
    payload: &T,
  ) -> Result<PendingAction> {
    let payload = serde_json::to_value(payload)
      .map_err(|e| eyre!("Failed to serialize payload for {}: {}", endpoint, e))?;
    let method = method.to_ascii_uppercase();
    let action = self.store.insert_action(endpoint, &method, &payload)?;
    debug!(id = action.id, endpoint, method = %method, "Queued action");
    Ok(action)
  }

  /// Replay queued actions in enqueue order.
  ///
  /// Stops at the first retryable failure, leaving that action and every
  /// later one queued. Permanently rejected actions are moved aside so they
  /// do not block the rest.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _guard = self.draining.lock().await;

    let actions = self.store.pending_actions()?;
    if actions.is_empty() {
      debug!("Action queue empty; nothing to replay");
      return Ok(DrainReport::default());
    }

    info!(count = actions.len(), "Replaying queued actions");
    let mut report = DrainReport::default();

    for (index, action) in actions.iter().enumerate() {
      match self.replayer.replay(action).await {
        Ok(()) => {
          self.store.delete_action(action.id)?;
          report.replayed += 1;
          debug!(id = action.id, endpoint = %action.endpoint, "Replayed action");
        }
        Err(ReplayError::Rejected(reason)) => {
          warn!(id = action.id, endpoint = %action.endpoint, reason = %reason, "Action rejected; moving aside");
          self.store.reject_action(action, &reason)?;
          report.rejected += 1;
        }
        Err(ReplayError::Retryable(reason)) => {
          warn!(id = action.id, endpoint = %action.endpoint, reason = %reason, "Replay failed; halting until next sync");
          report.halted = true;
          report.remaining = actions.len() - index;
          break;
        }
      }
    }

    info!(
      replayed = report.replayed,
      rejected = report.rejected,
      remaining = report.remaining,
      "Drain pass finished"
    );
    Ok(report)
  }

  /// Actions waiting to be replayed, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingAction>> {
    self.store.pending_actions()
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.store.pending_count()
  }

  /// Actions the server refused permanently.
  pub fn rejected(&self) -> Result<Vec<RejectedAction>> {
    self.store.rejected_actions()
  }
}


#[cfg(test)]
mod tests {
  use super::testing::RecordingReplayer;
  use super::*;
  use serde_json::json;

  fn queue() -> (ActionQueue, Arc<RecordingReplayer>) {
    let store = Arc::new(OfflineStore::open_in_memory().unwrap());
    let replayer = Arc::new(RecordingReplayer::default());
    (ActionQueue::new(store, replayer.clone()), replayer)
  }

  #[tokio::test]
  async fn test_enqueue_persists_without_network() {
    let (queue, replayer) = queue();
    let action = queue.enqueue("/api/trade", "post", &json!({"id": 1})).unwrap();

    assert_eq!(action.method, "POST");
    assert_eq!(queue.pending_count().unwrap(), 1);
    assert!(replayer.endpoints().is_empty());
  }

  #[tokio::test]
  async fn test_empty_drain_is_noop() {
    let (queue, replayer) = queue();
    let report = queue.drain().await.unwrap();
    assert_eq!(report, DrainReport::default());
    assert!(replayer.endpoints().is_empty());
  }

  #[tokio::test]
  async fn test_drain_replays_in_order_and_empties_store() {
    let (queue, replayer) = queue();
    queue.enqueue("/a", "POST", &1).unwrap();
    queue.enqueue("/b", "POST", &2).unwrap();
    queue.enqueue("/c", "POST", &3).unwrap();

    let report = queue.drain().await.unwrap();
    assert_eq!(report.replayed, 3);
    assert!(!report.halted);
    assert_eq!(replayer.endpoints(), vec!["/a", "/b", "/c"]);
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_failure_blocks_later_actions_until_retry() {
    let (queue, replayer) = queue();
    queue.enqueue("/a", "POST", &1).unwrap();
    queue.enqueue("/b", "POST", &2).unwrap();
    queue.enqueue("/c", "POST", &3).unwrap();
    replayer.fail_next("/a", ReplayError::Retryable("connection reset".into()));

    let report = queue.drain().await.unwrap();
    assert!(report.halted);
    assert_eq!(report.replayed, 0);
    assert_eq!(report.remaining, 3);
    // B and C were never attempted.
    assert_eq!(replayer.endpoints(), vec!["/a"]);
    assert_eq!(queue.pending_count().unwrap(), 3);

    let report = queue.drain().await.unwrap();
    assert_eq!(report.replayed, 3);
    assert_eq!(replayer.endpoints(), vec!["/a", "/a", "/b", "/c"]);
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_mid_queue_failure_keeps_confirmed_prefix_removed() {
    let (queue, replayer) = queue();
    queue.enqueue("/a", "POST", &1).unwrap();
    queue.enqueue("/b", "POST", &2).unwrap();
    queue.enqueue("/c", "POST", &3).unwrap();
    replayer.fail_next("/b", ReplayError::Retryable("503".into()));

    let report = queue.drain().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.remaining, 2);
    let left: Vec<String> = queue
      .pending()
      .unwrap()
      .into_iter()
      .map(|a| a.endpoint)
      .collect();
    assert_eq!(left, vec!["/b", "/c"]);
  }

  #[tokio::test]
  async fn test_rejected_action_does_not_block_queue() {
    let (queue, replayer) = queue();
    queue.enqueue("/bad", "POST", &json!({"qty": -1})).unwrap();
    queue.enqueue("/good", "POST", &json!({"qty": 1})).unwrap();
    replayer.fail_next("/bad", ReplayError::Rejected("400 Bad Request".into()));

    let report = queue.drain().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.replayed, 1);
    assert_eq!(queue.pending_count().unwrap(), 0);

    let rejected = queue.rejected().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].action.endpoint, "/bad");
    assert_eq!(replayer.endpoints(), vec!["/bad", "/good"]);
  }

  #[tokio::test]
  async fn test_concurrent_drains_do_not_duplicate() {
    let (queue, replayer) = queue();
    queue.enqueue("/a", "POST", &1).unwrap();
    queue.enqueue("/b", "POST", &2).unwrap();

    let (first, second) = tokio::join!(queue.drain(), queue.drain());
    assert_eq!(first.unwrap().replayed + second.unwrap().replayed, 2);
    assert_eq!(replayer.endpoints(), vec!["/a", "/b"]);
  }
}
