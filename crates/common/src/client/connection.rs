use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::EndpointConfig;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport closed")]
    Closed,
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One established connection, split into its outbound and inbound halves.
///  The inbound stream ending means the connection is closed.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(
        sink: impl Sink<String, Error = TransportError> + Send + 'static,
        stream: impl Stream<Item = Result<String, TransportError>> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens message-framed connections to the store gateway
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Transport, TransportError>;
}

/// Connects to a gateway over WebSocket, passing the connection string
///  as the `dsn` query parameter
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    backend: Url,
}

impl WebSocketConnector {
    pub fn new(backend: Url) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Url {
        &self.backend
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Transport, TransportError> {
        let url = endpoint.gateway_url(&self.backend);
        tracing::debug!(backend = %self.backend, endpoint = %endpoint, "opening websocket");
        let (socket, _) = connect_async(url.as_str()).await?;
        let (write, read) = socket.split();

        let sink = write.with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                // control frames are answered by tungstenite itself
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::from(err))),
            })
        });
        Ok(Transport::new(sink, stream))
    }
}
