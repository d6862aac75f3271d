use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection closed")]
    Closed,
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open push connection, split into its outbound and inbound text halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Connection, TransportError>;
}

#[derive(Debug, Default, Clone)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &Url) -> Result<Connection, TransportError> {
        let (socket, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        debug!(status = %response.status(), "websocket handshake complete");

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|text: String| futures::future::ready(Ok::<_, TransportError>(Message::Text(text))));

        // Only text frames carry notifications; tungstenite answers pings itself.
        let stream = stream.filter_map(|msg| {
            futures::future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "close frame received");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
