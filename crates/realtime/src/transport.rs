//! Connector seam between the manager and the wire.

use async_trait::async_trait;
use futures::{Sink, Stream};
use std::pin::Pin;

use crate::error::RealtimeError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = RealtimeError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, RealtimeError>> + Send>>;

/// An open bidirectional text channel. The stream ending means the peer closed it.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = RealtimeError> + Send + 'static,
        St: Stream<Item = Result<String, RealtimeError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens channels to an address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Connection, RealtimeError>;
}

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

#[cfg(feature = "websocket")]
mod websocket {
    use super::*;
    use futures::{future, SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    /// `ws://` and `wss://` connector.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WebSocketConnector;

    #[async_trait]
    impl Connector for WebSocketConnector {
        async fn connect(&self, address: &str) -> Result<Connection, RealtimeError> {
            let (socket, response) = tokio_tungstenite::connect_async(address)
                .await
                .map_err(|err| RealtimeError::connect(address, err))?;
            tracing::debug!(address, status = %response.status(), "websocket handshake complete");

            let (write, read) = socket.split();
            let sink = write
                .sink_map_err(RealtimeError::from)
                .with(|text: String| future::ready(Ok::<_, RealtimeError>(Message::Text(text))));
            let stream = read.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            tracing::debug!("ignoring non-utf8 binary frame");
                            None
                        }
                    },
                    // Control frames are answered by tungstenite itself.
                    Ok(_) => None,
                    Err(err) => Some(Err(RealtimeError::from(err))),
                })
            });
            Ok(Connection::new(sink, stream))
        }
    }
}
