//! Live-update stream with automatic recovery.
//!
//! [`StreamManager`] keeps one duplex connection open, reconnects with
//! exponential backoff, detects half-open connections through heartbeats and
//! re-sends the topic subscription set on every reconnect.

mod backoff;
mod manager;
mod protocol;
mod transport;

pub use backoff::ReconnectPolicy;
pub use manager::{ConnectionState, StreamManager, StreamOptions};
pub use protocol::{parse_frame, ClientFrame, EventKind, Inbound, StreamMessage};
pub use transport::{Connector, FrameChannel, FrameSink, FrameStream, WsConnector};
