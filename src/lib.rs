//! Client-side data resilience layer.
//!
//! - [`cache::QueryCache`]: stale-while-revalidate query cache with
//!   garbage collection and change notification
//! - [`stream::StreamManager`]: duplex live-update connection with
//!   reconnect backoff, heartbeat liveness and resubscription
//! - [`offline::ActionQueue`]: durable FIFO queue of mutating requests,
//!   replayed by [`offline::SyncTrigger`] when connectivity returns

pub mod cache;
pub mod config;
pub mod listeners;
pub mod logging;
pub mod offline;
pub mod stream;
