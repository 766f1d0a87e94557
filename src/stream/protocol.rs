//! JSON frames exchanged with the stream server.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClientFrame {
  Control {
    action: ControlAction,
    symbols: Vec<String>,
  },
  Ping {
    #[serde(rename = "type")]
    kind: PingKind,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
  Subscribe,
  Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PingKind {
  Ping,
}

impl ClientFrame {
  pub fn subscribe(symbols: Vec<String>) -> Self {
    Self::Control {
      action: ControlAction::Subscribe,
      symbols,
    }
  }

  pub fn unsubscribe(symbols: Vec<String>) -> Self {
    Self::Control {
      action: ControlAction::Unsubscribe,
      symbols,
    }
  }

  pub fn ping() -> Self {
    Self::Ping {
      kind: PingKind::Ping,
    }
  }

  pub fn to_text(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| eyre!("Failed to encode frame: {}", e))
  }
}

/// Class of an inbound frame, taken from its `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Price,
  Volume,
  Depth,
  Heartbeat,
}

impl EventKind {
  pub const ALL: [EventKind; 4] = [Self::Price, Self::Volume, Self::Depth, Self::Heartbeat];

  pub fn from_wire(kind: &str) -> Option<Self> {
    match kind {
      "price" => Some(Self::Price),
      "volume" => Some(Self::Volume),
      "depth" => Some(Self::Depth),
      "heartbeat" => Some(Self::Heartbeat),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Price => "price",
      Self::Volume => "volume",
      Self::Depth => "depth",
      Self::Heartbeat => "heartbeat",
    }
  }
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A decoded inbound frame. The payload is kept as raw JSON; its schema
/// belongs to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
  pub kind: EventKind,
  pub payload: Value,
}

impl StreamMessage {
  /// The `symbol` field, present on most market frames.
  pub fn symbol(&self) -> Option<&str> {
    self.payload.get("symbol").and_then(Value::as_str)
  }
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
  Message(StreamMessage),
  /// Well-formed frame with a `type` this client does not handle
  Unknown(String),
}

/// Decode an inbound text frame.
pub fn parse_frame(text: &str) -> Result<Inbound> {
  let payload: Value =
    serde_json::from_str(text).map_err(|e| eyre!("Malformed stream frame: {}", e))?;
  let kind = payload
    .get("type")
    .and_then(Value::as_str)
    .ok_or_else(|| eyre!("Stream frame has no type field"))?;

  match EventKind::from_wire(kind) {
    Some(kind) => Ok(Inbound::Message(StreamMessage { kind, payload })),
    None => Ok(Inbound::Unknown(kind.to_string())),
  }
}
