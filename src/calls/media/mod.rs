//! Contract with the external WebRTC media engine.
//!
//! The engine owns capture, encoding, ICE and DTLS. This crate only decides
//! when transports are created and closed and which tracks are attached to
//! them. Negotiation the engine cannot do on its own (connecting a transport,
//! registering a producer) goes back through [`TransportHooks`].
//!
//! [`HeadlessMediaEngine`] implements the contract without touching any
//! device; the CLI probe and the tests run on it.

mod headless;

pub use headless::{HeadlessMediaEngine, HeadlessOptions, HeadlessStats};

use crate::calls::error::NegotiationError;
use crate::protocol::TransportParams;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which camera feeds the video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing_mode: FacingMode,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera or microphone unavailable: {0}")]
    Unavailable(String),
    #[error("transport is closed")]
    TransportClosed,
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("media engine error: {0}")]
    Engine(String),
}

/// A local capture track.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn set_enabled(&self, enabled: bool);
    fn set_facing_mode(&self, mode: FacingMode) -> Result<(), MediaError>;
    /// Stop capturing and release the device. Stopping twice is harmless.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// The tracks returned by one capture request.
#[derive(Clone, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    /// Stop every track that is still live, returning how many were stopped.
    pub fn stop(&self) -> usize {
        let mut stopped = 0;
        for track in &self.tracks {
            if !track.is_stopped() {
                track.stop();
                stopped += 1;
            }
        }
        stopped
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tracks.iter().map(|t| (t.kind(), t.id().to_string())))
            .finish()
    }
}

/// What the engine wants registered with the server for a new producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProduceOptions {
    /// Lower bound for the encoder bitrate, in bits per second.
    pub min_bitrate: Option<u32>,
    pub app_data: Value,
}

/// Parameters the server returns for a new consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Negotiation callbacks the engine calls while it sets a transport up.
#[async_trait]
pub trait TransportHooks: Send + Sync {
    /// Forward the local DTLS parameters; the transport is usable once this returns `Ok`.
    async fn connect(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), NegotiationError>;

    /// Register a producer with the server and return the id it assigned.
    async fn produce(
        &self,
        transport_id: &str,
        request: ProduceRequest,
    ) -> Result<String, NegotiationError>;
}

pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;

    async fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        options: ProduceOptions,
    ) -> Result<Arc<dyn Producer>, MediaError>;

    /// Close the transport and every producer on it.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Build a consumer from server-provided parameters. It starts paused.
    async fn consume(&self, params: ConsumerParams) -> Result<Arc<dyn Consumer>, MediaError>;

    /// Close the transport and every consumer on it.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn acquire_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError>;

    /// RTP capabilities of the local device, sent with `create-consumer`.
    fn rtp_capabilities(&self) -> Value;

    fn create_send_transport(
        &self,
        params: &TransportParams,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn SendTransport>, MediaError>;

    fn create_recv_transport(
        &self,
        params: &TransportParams,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn RecvTransport>, MediaError>;
}
