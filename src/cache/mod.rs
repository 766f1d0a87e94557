//! Read cache with stale-while-revalidate semantics.
//!
//! This module provides a transport-agnostic caching mechanism that:
//! - Serves fresh entries without touching the network
//! - Serves stale entries immediately and refreshes them in the background
//! - Evicts entries past their cache time, lazily on read and periodically
//! - Notifies per-key subscribers on every change

mod layer;
mod storage;
mod traits;

pub use layer::{QueryCache, DEFAULT_GC_INTERVAL};
pub use traits::{
  CacheChange, CacheOptions, CacheResult, CacheSource, DEFAULT_CACHE_TIME, DEFAULT_STALE_TIME,
};
