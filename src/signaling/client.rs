//! WebSocket signaling adapter
//!
//! Connects to the relay (plaintext or TLS by URL scheme), registers as the
//! broadcaster, and shuttles JSON text frames both ways. I/O runs on a
//! dedicated writer task plus a reader task; inbound events are dispatched
//! to the handler one at a time.

use crate::signaling::protocol::{InboundMessage, OutboundMessage};
use crate::signaling::{SignalingHandler, SignalingOutbound};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on establishing the relay connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket signaling adapter
pub struct SignalingAdapter {
    url: String,
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl SignalingAdapter {
    /// Create an adapter for the given relay URL
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Connect and start the I/O tasks
    ///
    /// TLS is selected by the `wss://` scheme. Fails if the relay is not
    /// reachable within five seconds.
    pub async fn connect(&self, handler: Arc<dyn SignalingHandler>) -> Result<()> {
        info!("connecting to signaling server: {}", self.url);

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                Error::OperationTimeout(format!("signaling connect to {} timed out", self.url))
            })?
            .map_err(|e| Error::WebSocket(format!("failed to connect: {}", e)))?;

        info!("connected to signaling server");
        let (write, read) = ws_stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        tokio::spawn(Self::writer_task(write, rx));
        tokio::spawn(Self::reader_task(read, handler));

        Ok(())
    }

    /// Register this process as the broadcaster of `stream_id`
    pub fn register_broadcaster(&self, stream_id: &str) -> Result<()> {
        info!(stream_id, "registering as broadcaster");
        self.send(OutboundMessage::register(stream_id))
    }

    /// Writer task: drains the outbound channel into the socket
    async fn writer_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("failed to send signaling frame: {}", e);
                break;
            }
        }
        debug!("signaling writer task ended");
    }

    /// Reader task: parses frames and dispatches them sequentially
    async fn reader_task(
        mut read: futures::stream::SplitStream<WsStream>,
        handler: Arc<dyn SignalingHandler>,
    ) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match InboundMessage::from_json(&text) {
                    Ok(message) => Self::dispatch(message, handler.as_ref()).await,
                    Err(e) => warn!("ignoring malformed signaling frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("signaling connection closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("signaling socket error: {}", e);
                    break;
                }
            }
        }
        // No automatic reconnection: in-flight viewers keep streaming
        // until their sessions fail on their own.
        warn!("signaling disconnected; new viewers can no longer join");
    }

    async fn dispatch(message: InboundMessage, handler: &dyn SignalingHandler) {
        match message {
            InboundMessage::ViewerJoined { viewer_id } => {
                handler.on_viewer_joined(viewer_id).await;
            }
            InboundMessage::Answer { from, sdp } => {
                handler.on_answer(from, sdp).await;
            }
            InboundMessage::IceCandidate {
                from,
                candidate,
                sdp_mline_index,
            } => {
                handler
                    .on_ice_candidate(from, candidate, sdp_mline_index)
                    .await;
            }
            InboundMessage::ViewerLeft { viewer_id } => {
                handler.on_viewer_left(viewer_id).await;
            }
        }
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        let json = message.to_json()?;
        debug!("sending signaling frame: {}", json);

        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Signaling("not connected".to_string()))?;
        tx.send(Message::Text(json))
            .map_err(|e| Error::Signaling(format!("failed to queue frame: {}", e)))
    }
}

#[async_trait]
impl SignalingOutbound for SignalingAdapter {
    async fn send_offer(&self, to: &str, sdp: &str) -> Result<()> {
        self.send(OutboundMessage::Offer {
            to: to.to_string(),
            sdp: sdp.to_string(),
        })
    }

    async fn send_ice_candidate(
        &self,
        to: &str,
        candidate: &str,
        sdp_mline_index: u16,
    ) -> Result<()> {
        self.send(OutboundMessage::IceCandidate {
            to: to.to_string(),
            candidate: candidate.to_string(),
            sdp_mline_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_creation() {
        let adapter = SignalingAdapter::new("ws://localhost:8080");
        assert_eq!(adapter.url, "ws://localhost:8080");
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let adapter = SignalingAdapter::new("ws://localhost:8080");
        assert!(adapter.register_broadcaster("stream").is_err());
        assert!(adapter.send_offer("A", "v=0").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_relay_fails() {
        let adapter = SignalingAdapter::new("ws://127.0.0.1:1");

        struct NullHandler;
        #[async_trait]
        impl SignalingHandler for NullHandler {
            async fn on_viewer_joined(&self, _viewer_id: String) {}
            async fn on_answer(&self, _viewer_id: String, _sdp: String) {}
            async fn on_ice_candidate(&self, _v: String, _c: String, _m: u16) {}
            async fn on_viewer_left(&self, _viewer_id: String) {}
        }

        assert!(adapter.connect(Arc::new(NullHandler)).await.is_err());
    }
}
