use crate::credentials::Credential;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use crate::socket::TokioWebSocketTransportFactory;

/// Why a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by either side without an error.
    Closed,
    /// The server rejected the credential on a live connection.
    Unauthorized(String),
    Error(String),
}

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    TextReceived(String),
    /// Answer to a keepalive ping.
    Pong,
    /// The connection was lost.
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("server rejected the credential: {0}")]
    Unauthorized(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket is closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame to the server.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Sends a keepalive ping. The answer arrives as [`TransportEvent::Pong`].
    async fn ping(&self) -> Result<(), TransportError>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens an authenticated connection and returns it, along with a stream of events.
    async fn create_transport(
        &self,
        url: &str,
        credential: &Credential,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError>;
}
