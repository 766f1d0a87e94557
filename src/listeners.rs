//! Ordered callback fan-out with drop-to-unsubscribe handles.
//!
//! Callbacks are invoked in registration order. `emit` snapshots the callback
//! list before calling out, so a callback may subscribe or unsubscribe (itself
//! or others) without deadlocking; changes take effect from the next `emit`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
  next_id: u64,
  callbacks: Vec<(u64, Callback<E>)>,
}

/// A set of callbacks interested in events of type `E`.
pub struct Listeners<E> {
  registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Listeners<E> {
  pub fn new() -> Self {
    Self {
      registry: Arc::new(Mutex::new(Registry {
        next_id: 0,
        callbacks: Vec::new(),
      })),
    }
  }

  /// Register a callback. It stays registered until the returned
  /// [`Subscription`] is dropped or explicitly unsubscribed.
  pub fn add<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    let id = {
      let mut registry = lock(&self.registry);
      let id = registry.next_id;
      registry.next_id += 1;
      registry.callbacks.push((id, Arc::new(callback)));
      id
    };

    let registry: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
    Subscription::new(move || {
      if let Some(registry) = registry.upgrade() {
        lock(&registry).callbacks.retain(|(existing, _)| *existing != id);
      }
    })
  }

  /// Deliver `event` to every registered callback.
  pub fn emit(&self, event: &E) {
    let snapshot: Vec<Callback<E>> = lock(&self.registry)
      .callbacks
      .iter()
      .map(|(_, callback)| Arc::clone(callback))
      .collect();

    for callback in snapshot {
      callback(event);
    }
  }

  pub fn len(&self) -> usize {
    lock(&self.registry).callbacks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<E: 'static> Default for Listeners<E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<E> Clone for Listeners<E> {
  fn clone(&self) -> Self {
    Self {
      registry: Arc::clone(&self.registry),
    }
  }
}

impl<E> fmt::Debug for Listeners<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Listeners")
      .field("len", &lock(&self.registry).callbacks.len())
      .finish()
  }
}

/// Handle returned by every subscribe-style call.
///
/// Dropping the handle removes the callback. Use [`Subscription::detach`] to
/// keep a callback registered for the lifetime of its source.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
  fn new<F>(cancel: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    Self {
      cancel: Some(Box::new(cancel)),
    }
  }

  /// Remove the callback now.
  pub fn unsubscribe(mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }

  /// Give up the handle without unsubscribing.
  pub fn detach(mut self) {
    self.cancel = None;
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.cancel.is_some())
      .finish()
  }
}

// Callbacks never run while the registry lock is held, so a poisoned lock
// only means a panic happened mid-bookkeeping; the Vec is still consistent.
fn lock<E>(registry: &Mutex<Registry<E>>) -> MutexGuard<'_, Registry<E>> {
  registry.lock().unwrap_or_else(PoisonError::into_inner)
}
