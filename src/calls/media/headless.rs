//! A media engine with no devices behind it.
//!
//! Tracks carry no samples and transports do not open any socket, but the
//! negotiation is real: the first produce or consume on a transport runs the
//! `connect` hook, and every produce goes through the `produce` hook so the
//! server assigns the producer id.

use super::{
    Consumer, ConsumerParams, FacingMode, LocalStream, MediaConstraints, MediaEngine, MediaError,
    MediaKind, MediaTrack, ProduceOptions, ProduceRequest, Producer, RecvTransport, SendTransport,
    TransportHooks,
};
use crate::protocol::TransportParams;
use async_trait::async_trait;
use log::{debug, trace};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Knobs for simulating device trouble.
#[derive(Debug, Clone, Default)]
pub struct HeadlessOptions {
    /// Fail every capture request with this message.
    pub acquire_error: Option<String>,
    /// Track kinds whose produce call fails on the engine side.
    pub failing_kinds: Vec<MediaKind>,
    /// Capture only audio.
    pub audio_only: bool,
}

/// Live resource counters, shared by everything the engine creates.
#[derive(Debug, Default)]
pub struct HeadlessStats {
    live_tracks: AtomicUsize,
    open_transports: AtomicUsize,
    transport_closes: AtomicUsize,
    acquisitions: AtomicUsize,
}

impl HeadlessStats {
    /// Tracks captured and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    pub fn open_transports(&self) -> usize {
        self.open_transports.load(Ordering::SeqCst)
    }

    /// Every `close` call on a transport, including repeated ones.
    pub fn transport_closes(&self) -> usize {
        self.transport_closes.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

pub struct HeadlessMediaEngine {
    options: HeadlessOptions,
    stats: Arc<HeadlessStats>,
    next_id: AtomicU64,
}

impl Default for HeadlessMediaEngine {
    fn default() -> Self {
        Self::new(HeadlessOptions::default())
    }
}

impl HeadlessMediaEngine {
    pub fn new(options: HeadlessOptions) -> Self {
        Self {
            options,
            stats: Arc::new(HeadlessStats::default()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> Arc<HeadlessStats> {
        self.stats.clone()
    }

    fn next_track_id(&self, kind: MediaKind) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("headless-{kind}-{n}")
    }

    fn track(&self, kind: MediaKind, facing_mode: FacingMode) -> Arc<dyn MediaTrack> {
        self.stats.live_tracks.fetch_add(1, Ordering::SeqCst);
        Arc::new(HeadlessTrack {
            id: self.next_track_id(kind),
            kind,
            enabled: AtomicBool::new(true),
            facing_mode: AtomicU8::new(facing_mode as u8),
            stopped: AtomicBool::new(false),
            stats: self.stats.clone(),
        })
    }

    fn transport_core(
        &self,
        params: &TransportParams,
        hooks: Arc<dyn TransportHooks>,
    ) -> TransportCore {
        self.stats.open_transports.fetch_add(1, Ordering::SeqCst);
        TransportCore {
            id: params.id.clone(),
            hooks,
            connected: Mutex::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            stats: self.stats.clone(),
        }
    }
}

#[async_trait]
impl MediaEngine for HeadlessMediaEngine {
    async fn acquire_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        self.stats.acquisitions.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.options.acquire_error {
            return Err(MediaError::Unavailable(reason.clone()));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.track(MediaKind::Audio, constraints.facing_mode));
        }
        if constraints.video && !self.options.audio_only {
            tracks.push(self.track(MediaKind::Video, constraints.facing_mode));
        }
        debug!(target: "Calls/Media", "Captured {} headless track(s)", tracks.len());
        Ok(LocalStream::new(tracks))
    }

    fn rtp_capabilities(&self) -> Value {
        json!({
            "codecs": [
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
            ],
            "headerExtensions": []
        })
    }

    fn create_send_transport(
        &self,
        params: &TransportParams,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn SendTransport>, MediaError> {
        Ok(Arc::new(HeadlessSendTransport {
            core: self.transport_core(params, hooks),
            failing_kinds: self.options.failing_kinds.clone(),
        }))
    }

    fn create_recv_transport(
        &self,
        params: &TransportParams,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn RecvTransport>, MediaError> {
        Ok(Arc::new(HeadlessRecvTransport {
            core: self.transport_core(params, hooks),
        }))
    }
}

struct HeadlessTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    facing_mode: AtomicU8,
    stopped: AtomicBool,
    stats: Arc<HeadlessStats>,
}

impl MediaTrack for HeadlessTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_facing_mode(&self, mode: FacingMode) -> Result<(), MediaError> {
        if self.kind != MediaKind::Video {
            return Err(MediaError::Engine("not a camera track".into()));
        }
        if self.is_stopped() {
            return Err(MediaError::Engine("track is stopped".into()));
        }
        self.facing_mode.store(mode as u8, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stats.live_tracks.fetch_sub(1, Ordering::SeqCst);
            trace!(target: "Calls/Media", "Stopped track {}", self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct TransportCore {
    id: String,
    hooks: Arc<dyn TransportHooks>,
    connected: Mutex<bool>,
    closed: Arc<AtomicBool>,
    stats: Arc<HeadlessStats>,
}

impl TransportCore {
    /// Run the `connect` hook once, on first use.
    async fn ensure_connected(&self) -> Result<(), MediaError> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            let dtls = json!({
                "role": "auto",
                "fingerprints": [{"algorithm": "sha-256", "value": format!("headless:{}", self.id)}]
            });
            self.hooks.connect(&self.id, dtls).await?;
            *connected = true;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::TransportClosed)
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        self.stats.transport_closes.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.open_transports.fetch_sub(1, Ordering::SeqCst);
            debug!(target: "Calls/Media", "Closed transport {}", self.id);
        }
    }
}

struct HeadlessSendTransport {
    core: TransportCore,
    failing_kinds: Vec<MediaKind>,
}

#[async_trait]
impl SendTransport for HeadlessSendTransport {
    fn id(&self) -> &str {
        &self.core.id
    }

    async fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        options: ProduceOptions,
    ) -> Result<Arc<dyn Producer>, MediaError> {
        self.core.check_open()?;
        let kind = track.kind();
        if self.failing_kinds.contains(&kind) {
            return Err(MediaError::Engine(format!("{kind} encoder failed to start")));
        }
        self.core.ensure_connected().await?;

        let mut encoding = json!({"ssrc": self.core.id.len() as u64 * 1000 + kind as u64});
        if let Some(min_bitrate) = options.min_bitrate {
            encoding["minBitrate"] = json!(min_bitrate);
        }
        let rtp_parameters = json!({
            "mid": kind.as_str(),
            "codecs": [],
            "encodings": [encoding],
        });
        let id = self
            .core
            .hooks
            .produce(
                &self.core.id,
                ProduceRequest {
                    kind,
                    rtp_parameters,
                    app_data: options.app_data,
                },
            )
            .await?;
        // The transport may have been closed while the server was answering.
        self.core.check_open()?;

        Ok(Arc::new(HeadlessProducer {
            id,
            kind,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transport_closed: self.core.closed.clone(),
        }))
    }

    fn close(&self) {
        self.core.close();
    }

    fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

struct HeadlessRecvTransport {
    core: TransportCore,
}

#[async_trait]
impl RecvTransport for HeadlessRecvTransport {
    fn id(&self) -> &str {
        &self.core.id
    }

    async fn consume(&self, params: ConsumerParams) -> Result<Arc<dyn Consumer>, MediaError> {
        self.core.check_open()?;
        self.core.ensure_connected().await?;
        self.core.check_open()?;
        Ok(Arc::new(HeadlessConsumer {
            id: params.id,
            producer_id: params.producer_id,
            kind: params.kind,
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            transport_closed: self.core.closed.clone(),
        }))
    }

    fn close(&self) {
        self.core.close();
    }

    fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

struct HeadlessProducer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
    transport_closed: Arc<AtomicBool>,
}

impl Producer for HeadlessProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.transport_closed.load(Ordering::SeqCst)
    }
}

struct HeadlessConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
    transport_closed: Arc<AtomicBool>,
}

impl Consumer for HeadlessConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.transport_closed.load(Ordering::SeqCst)
    }
}
