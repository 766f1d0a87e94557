//! Offline support: a durable queue of mutating actions, a cache of
//! last-known data, and the trigger that replays the queue when
//! connectivity returns.

mod queue;
mod replay;
mod store;
mod sync;

pub use queue::{ActionQueue, DrainReport, ReplayError, Replayer};
pub use replay::{classify, HttpReplayer};
pub use store::{OfflineStore, PendingAction, RejectedAction, DEFAULT_CACHED_DATA_MAX_AGE};
pub use sync::{SyncOptions, SyncTrigger, DEFAULT_SYNC_TAG};
