//! Stream connection manager.
//!
//! Owns one persistent connection and a driver task that walks the state
//! machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          ^                    |
//!      |                          |               close/error/
//!      |                        timer            heartbeat timeout
//!      |                          |                    v
//!      +---attempt limit------ Reconnecting <----------+
//! ```
//!
//! `disconnect()` forces `Disconnected` from any state and aborts the driver,
//! which owns every reconnect and heartbeat timer.

use futures::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::protocol::{parse_frame, ClientFrame, EventKind, Inbound, StreamMessage};
use super::transport::{Connector, FrameChannel, FrameSink};
use crate::listeners::{Listeners, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Disconnected => "disconnected",
      Self::Connecting => "connecting",
      Self::Connected => "connected",
      Self::Reconnecting => "reconnecting",
    };
    f.write_str(name)
  }
}

/// Timing knobs for the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
  pub reconnect: ReconnectPolicy,
  /// How often liveness is checked and a ping is sent
  pub heartbeat_interval: Duration,
  /// Silence longer than this forces a reconnect
  pub heartbeat_timeout: Duration,
}

impl Default for StreamOptions {
  fn default() -> Self {
    Self {
      reconnect: ReconnectPolicy::default(),
      heartbeat_interval: Duration::from_secs(5),
      heartbeat_timeout: Duration::from_secs(10),
    }
  }
}

/// Keeps a live connection to the stream server and fans inbound frames out
/// to registered handlers.
///
/// Dropping the manager disconnects it.
pub struct StreamManager {
  shared: Arc<Shared>,
}

struct Status {
  state: ConnectionState,
  /// Bumped by every connect/disconnect; a driver only applies transitions
  /// for the epoch it was started with.
  epoch: u64,
}

struct Handlers {
  price: Listeners<StreamMessage>,
  volume: Listeners<StreamMessage>,
  depth: Listeners<StreamMessage>,
  heartbeat: Listeners<StreamMessage>,
}

impl Handlers {
  fn new() -> Self {
    Self {
      price: Listeners::new(),
      volume: Listeners::new(),
      depth: Listeners::new(),
      heartbeat: Listeners::new(),
    }
  }

  fn for_kind(&self, kind: EventKind) -> &Listeners<StreamMessage> {
    match kind {
      EventKind::Price => &self.price,
      EventKind::Volume => &self.volume,
      EventKind::Depth => &self.depth,
      EventKind::Heartbeat => &self.heartbeat,
    }
  }
}

struct Shared {
  connector: Arc<dyn Connector>,
  options: StreamOptions,
  status: Mutex<Status>,
  attempts: AtomicU32,
  /// Topics to (re)subscribe on every open connection
  topics: Mutex<BTreeSet<String>>,
  /// Frame queue of the open session, if any
  outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
  handlers: Handlers,
  state_listeners: Listeners<ConnectionState>,
  driver: Mutex<Option<JoinHandle<()>>>,
}

impl StreamManager {
  pub fn new<C: Connector>(connector: C, options: StreamOptions) -> Self {
    Self::with_connector(Arc::new(connector), options)
  }

  pub fn with_connector(connector: Arc<dyn Connector>, options: StreamOptions) -> Self {
    Self {
      shared: Arc::new(Shared {
        connector,
        options,
        status: Mutex::new(Status {
          state: ConnectionState::Disconnected,
          epoch: 0,
        }),
        attempts: AtomicU32::new(0),
        topics: Mutex::new(BTreeSet::new()),
        outbound: Mutex::new(None),
        handlers: Handlers::new(),
        state_listeners: Listeners::new(),
        driver: Mutex::new(None),
      }),
    }
  }

  /// Start connecting. No-op unless the manager is `Disconnected`. Must be
  /// called from within a tokio runtime.
  ///
  /// May be called from a state-change handler, including the one that
  /// observes the driver giving up.
  pub fn connect(&self) {
    let (start_tx, start_rx) = oneshot::channel();
    {
      let mut driver = lock(&self.shared.driver);

      let epoch = {
        let mut status = lock(&self.shared.status);
        if status.state != ConnectionState::Disconnected {
          debug!(state = %status.state, "connect() ignored; stream already active");
          return;
        }
        status.epoch += 1;
        status.state = ConnectionState::Connecting;
        status.epoch
      };
      // A driver that just gave up may still be unwinding; its epoch is stale.
      if let Some(stale) = driver.take() {
        stale.abort();
      }
      self.shared.attempts.store(0, Ordering::SeqCst);

      let shared = Arc::clone(&self.shared);
      *driver = Some(tokio::spawn(async move {
        // Hold off until `Connecting` has been announced.
        let _ = start_rx.await;
        shared.run(epoch).await;
      }));
    }

    self
      .shared
      .announce(ConnectionState::Disconnected, ConnectionState::Connecting);
    let _ = start_tx.send(());
  }

  /// Close the connection and cancel every pending timer. Safe to call from
  /// any state, any number of times.
  pub fn disconnect(&self) {
    let previous = {
      let mut status = lock(&self.shared.status);
      status.epoch += 1;
      std::mem::replace(&mut status.state, ConnectionState::Disconnected)
    };
    if let Some(handle) = lock(&self.shared.driver).take() {
      handle.abort();
    }
    lock(&self.shared.outbound).take();
    self.shared.attempts.store(0, Ordering::SeqCst);

    self
      .shared
      .announce(previous, ConnectionState::Disconnected);
  }

  /// Add topics. They are sent now if connected and re-sent on every
  /// reconnect.
  pub fn subscribe<I, S>(&self, topics: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
    if topics.is_empty() {
      return;
    }
    let mut set = lock(&self.shared.topics);
    set.extend(topics.iter().cloned());
    self.shared.send_if_open(ClientFrame::subscribe(topics));
  }

  /// Remove topics, telling the server if connected.
  pub fn unsubscribe<I, S>(&self, topics: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
    if topics.is_empty() {
      return;
    }
    let mut set = lock(&self.shared.topics);
    for topic in &topics {
      set.remove(topic);
    }
    self.shared.send_if_open(ClientFrame::unsubscribe(topics));
  }

  /// Register a handler for one class of inbound frame.
  pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
  where
    F: Fn(&StreamMessage) + Send + Sync + 'static,
  {
    self.shared.handlers.for_kind(kind).add(handler)
  }

  pub fn on_price<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&StreamMessage) + Send + Sync + 'static,
  {
    self.on(EventKind::Price, handler)
  }

  pub fn on_volume<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&StreamMessage) + Send + Sync + 'static,
  {
    self.on(EventKind::Volume, handler)
  }

  pub fn on_depth<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&StreamMessage) + Send + Sync + 'static,
  {
    self.on(EventKind::Depth, handler)
  }

  pub fn on_heartbeat<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&StreamMessage) + Send + Sync + 'static,
  {
    self.on(EventKind::Heartbeat, handler)
  }

  pub fn on_state_change<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&ConnectionState) + Send + Sync + 'static,
  {
    self.shared.state_listeners.add(handler)
  }

  pub fn state(&self) -> ConnectionState {
    lock(&self.shared.status).state
  }

  pub fn is_connected(&self) -> bool {
    self.state() == ConnectionState::Connected
  }

  /// Topics currently recorded for resubscription.
  pub fn subscriptions(&self) -> Vec<String> {
    lock(&self.shared.topics).iter().cloned().collect()
  }

  /// Reconnect cycles since the last successful open.
  pub fn reconnect_attempts(&self) -> u32 {
    self.shared.attempts.load(Ordering::SeqCst)
  }
}

impl Drop for StreamManager {
  fn drop(&mut self) {
    self.disconnect();
  }
}

impl fmt::Debug for StreamManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StreamManager")
      .field("state", &self.state())
      .field("options", &self.shared.options)
      .finish_non_exhaustive()
  }
}

impl Shared {
  /// Apply a driver transition if no connect/disconnect happened since the
  /// driver started.
  fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
    let previous = {
      let mut status = lock(&self.status);
      if status.epoch != epoch {
        return false;
      }
      std::mem::replace(&mut status.state, next)
    };
    self.announce(previous, next);
    true
  }

  fn announce(&self, previous: ConnectionState, next: ConnectionState) {
    if previous != next {
      info!(from = %previous, to = %next, "Stream state changed");
      self.state_listeners.emit(&next);
    }
  }

  fn send_if_open(&self, frame: ClientFrame) {
    if let Some(outbound) = lock(&self.outbound).as_ref() {
      let _ = outbound.send(frame);
    }
  }

  async fn run(self: Arc<Self>, epoch: u64) {
    loop {
      match self.connector.connect().await {
        Ok(channel) => self.run_session(epoch, channel).await,
        Err(e) => warn!(error = %e, "Stream connection failed"),
      }

      if !self.transition(epoch, ConnectionState::Reconnecting) {
        return;
      }

      let attempt = self.attempts.load(Ordering::SeqCst);
      if self.options.reconnect.attempts_exhausted(attempt) {
        warn!(attempts = attempt, "Giving up on stream reconnect");
        self.transition(epoch, ConnectionState::Disconnected);
        return;
      }

      let delay = self.options.reconnect.delay_for(attempt);
      self.attempts.store(attempt + 1, Ordering::SeqCst);
      info!(
        attempt = attempt + 1,
        delay_ms = delay.as_millis() as u64,
        "Scheduling stream reconnect"
      );
      tokio::time::sleep(delay).await;

      if !self.transition(epoch, ConnectionState::Connecting) {
        return;
      }
    }
  }

  /// Mark the connection open and hand back the topics to resubscribe.
  ///
  /// The topic lock is held while the session's frame queue is installed so
  /// a concurrent `subscribe` is either in the snapshot or sent through the
  /// queue, never lost.
  fn open_session(
    &self,
    epoch: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
  ) -> Option<Vec<String>> {
    let (previous, topics) = {
      let topics = lock(&self.topics);
      let mut status = lock(&self.status);
      if status.epoch != epoch {
        return None;
      }
      *lock(&self.outbound) = Some(outbound);
      self.attempts.store(0, Ordering::SeqCst);
      let previous = std::mem::replace(&mut status.state, ConnectionState::Connected);
      (previous, topics.iter().cloned().collect::<Vec<_>>())
    };
    self.announce(previous, ConnectionState::Connected);
    Some(topics)
  }

  fn close_session(&self, queue: &mpsc::UnboundedSender<ClientFrame>) {
    let mut outbound = lock(&self.outbound);
    if outbound.as_ref().is_some_and(|o| o.same_channel(queue)) {
      outbound.take();
    }
  }

  async fn run_session(&self, epoch: u64, channel: FrameChannel) {
    let FrameChannel {
      mut sink,
      mut stream,
    } = channel;
    let (queue, mut queued) = mpsc::unbounded_channel();

    let Some(topics) = self.open_session(epoch, queue.clone()) else {
      return;
    };

    // Resubscribe before reading anything so handlers never see data for a
    // topic the server was not told about on this connection.
    if !topics.is_empty() {
      debug!(count = topics.len(), "Resubscribing stream topics");
      if let Err(e) = send_frame(&mut sink, &ClientFrame::subscribe(topics)).await {
        warn!(error = %e, "Failed to resubscribe");
        self.close_session(&queue);
        return;
      }
    }

    let period = self.options.heartbeat_interval;
    let mut last_heartbeat = Instant::now();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
      tokio::select! {
        inbound = stream.next() => match inbound {
          Some(Ok(text)) => {
            if self.dispatch(&text) == Some(EventKind::Heartbeat) {
              last_heartbeat = Instant::now();
            }
          }
          Some(Err(e)) => {
            warn!(error = %e, "Stream transport error");
            break;
          }
          None => {
            info!("Stream closed by server");
            break;
          }
        },
        Some(frame) = queued.recv() => {
          if let Err(e) = send_frame(&mut sink, &frame).await {
            warn!(error = %e, "Failed to send stream frame");
            break;
          }
        }
        _ = ticker.tick() => {
          let silence = last_heartbeat.elapsed();
          if silence > self.options.heartbeat_timeout {
            warn!(
              silence_ms = silence.as_millis() as u64,
              "No heartbeat from stream server; forcing reconnect"
            );
            let _ = sink.close().await;
            break;
          }
          if let Err(e) = send_frame(&mut sink, &ClientFrame::ping()).await {
            warn!(error = %e, "Failed to send ping");
            break;
          }
        }
      }
    }

    self.close_session(&queue);
  }

  /// Hand an inbound frame to its handlers, returning its class.
  fn dispatch(&self, text: &str) -> Option<EventKind> {
    match parse_frame(text) {
      Ok(Inbound::Message(message)) => {
        self.handlers.for_kind(message.kind).emit(&message);
        Some(message.kind)
      }
      Ok(Inbound::Unknown(kind)) => {
        debug!(kind = %kind, "Ignoring stream frame of unknown type");
        None
      }
      Err(e) => {
        warn!(error = %e, "Dropping undecodable stream frame");
        None
      }
    }
  }
}

async fn send_frame(sink: &mut FrameSink, frame: &ClientFrame) -> color_eyre::Result<()> {
  sink.send(frame.to_text()?).await
}

// Nothing here runs user code while a lock is held, so a poisoned lock still
// guards consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
