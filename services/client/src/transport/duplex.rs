//! WebSocket implementation of the duplex channel.

use super::{DuplexChannel, DuplexConnector, FrameSink, TransportError};
use async_trait::async_trait;
use chatstream_core::ConversationId;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the query service over a WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The endpoint for a given conversation. The service uses the hint to
    /// route the socket to the right conversation room.
    fn endpoint(&self, hint: Option<&ConversationId>) -> String {
        match hint {
            Some(id) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}conversation_id={}", self.url, sep, id)
            }
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl DuplexConnector for WsConnector {
    async fn connect(
        &self,
        hint: Option<ConversationId>,
    ) -> Result<DuplexChannel, TransportError> {
        let endpoint = self.endpoint(hint.as_ref());
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(%endpoint, "connected to query service");
        let (tx, rx) = ws_stream.split();

        let stream = rx
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "peer sent close frame");
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
                }
            })
            .boxed();

        Ok(DuplexChannel {
            sink: Box::new(WsSink(tx)),
            stream,
        })
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }
}
