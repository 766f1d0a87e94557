//! Duplex text-frame transports for the stream manager.

use color_eyre::{eyre::eyre, Report, Result};
use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, Sink, SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Outbound half of an open connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Report> + Send>>;

/// Inbound half of an open connection. The stream ends when the peer closes.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// An open connection carrying text frames.
pub struct FrameChannel {
  pub sink: FrameSink,
  pub stream: FrameStream,
}

/// Opens connections to the stream server.
pub trait Connector: Send + Sync + 'static {
  fn connect(&self) -> BoxFuture<'static, Result<FrameChannel>>;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
  url: String,
}

impl WsConnector {
  pub fn new(url: impl Into<String>) -> Self {
    Self { url: url.into() }
  }
}

impl Connector for WsConnector {
  fn connect(&self) -> BoxFuture<'static, Result<FrameChannel>> {
    let url = self.url.clone();
    async move {
      let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| eyre!("Failed to connect to {}: {}", url, e))?;
      debug!(url = %url, "WebSocket open");

      let (sink, stream) = socket.split();

      let sink = sink
        .sink_map_err(|e| eyre!("WebSocket send failed: {}", e))
        .with(|text: String| future::ready(Ok::<_, Report>(Message::Text(text))));

      let stream = stream
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
          future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(text)),
            // Control frames are answered by tungstenite itself
            Ok(_) => None,
            Err(e) => Some(Err(eyre!("WebSocket receive failed: {}", e))),
          })
        });

      Ok(FrameChannel {
        sink: Box::pin(sink),
        stream: stream.boxed(),
      })
    }
    .boxed()
  }
}
