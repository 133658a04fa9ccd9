//! Tokio WebSocket transport for the signaling channel.

use crate::credentials::Credential;
use crate::socket::consts::{AUTH_REJECTED_CLOSE_CODE, EVENT_CHANNEL_CAPACITY, FRAME_MAX_SIZE};
use crate::transport::{
    DisconnectReason, Transport, TransportError, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
    is_connected: AtomicBool,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
            is_connected: AtomicBool::new(true),
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if text.len() >= FRAME_MAX_SIZE {
            return Err(TransportError::Send(format!(
                "frame is too large (max: {}, got: {})",
                FRAME_MAX_SIZE,
                text.len()
            )));
        }
        trace!(target: "Socket", "--> {text}");
        self.send_message(Message::text(text)).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.send_message(Message::Ping(Default::default())).await
    }

    async fn disconnect(&self) {
        if self.is_connected.swap(false, Ordering::SeqCst) {
            if let Some(mut sink) = self.ws_sink.lock().await.take()
                && let Err(e) = sink.close().await
            {
                debug!(target: "Socket", "Error while closing websocket: {e}");
            }
        }
    }
}

/// Factory for creating Tokio WebSocket transports
#[derive(Debug, Default)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
        credential: &Credential,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        info!(target: "Socket", "Dialing {url}");
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid url {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|_| TransportError::Unauthorized("malformed credential".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response)
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                TransportError::Unauthorized(format!("upgrade refused with {}", response.status()))
            }
            other => TransportError::Connect(other.to_string()),
        })?;

        let (sink, stream) = stream.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        tokio::spawn(read_pump(stream, event_tx.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(target: "Socket", "<-- {}", text.as_str());
                if event_tx
                    .send(TransportEvent::TextReceived(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    warn!(target: "Socket", "Event receiver dropped, closing read pump");
                    break DisconnectReason::Closed;
                }
            }
            Some(Ok(Message::Pong(_))) => {
                let _ = event_tx.send(TransportEvent::Pong).await;
            }
            Some(Ok(Message::Close(frame))) => {
                trace!(target: "Socket", "Received close frame: {frame:?}");
                break match frame {
                    Some(frame) if u16::from(frame.code) == AUTH_REJECTED_CLOSE_CODE => {
                        DisconnectReason::Unauthorized(frame.reason.as_str().to_owned())
                    }
                    _ => DisconnectReason::Closed,
                };
            }
            // Pings are answered by tungstenite; binary frames are not part of the protocol.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(target: "Socket", "Error reading from websocket: {e}");
                break DisconnectReason::Error(e.to_string());
            }
            None => {
                trace!(target: "Socket", "Websocket stream ended");
                break DisconnectReason::Closed;
            }
        }
    };

    let _ = event_tx.send(TransportEvent::Disconnected(reason)).await;
}
