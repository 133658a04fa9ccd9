//! Media transports, producers and consumers of one call.
//!
//! [`MediaTransportPair`] is the only place handles live; it belongs to the
//! call session. [`MediaTransportManager`] does the negotiation work and hands
//! results back to the caller instead of keeping handles of its own.

use super::error::{CallError, NegotiationError};
use super::media::{
    Consumer, ConsumerParams, FacingMode, LocalStream, MediaConstraints, MediaEngine, MediaError,
    MediaKind, ProduceOptions, ProduceRequest, Producer, RecvTransport, SendTransport,
    TransportHooks,
};
use crate::channel::Signaling;
use crate::protocol::{ClientEvent, TransportParams, parse_ack};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Send and receive transports of one call, with the producers and consumers on them.
#[derive(Default)]
pub struct MediaTransportPair {
    pub(crate) send: Option<Arc<dyn SendTransport>>,
    pub(crate) recv: Option<Arc<dyn RecvTransport>>,
    producers: HashMap<String, Arc<dyn Producer>>,
    consumers: HashMap<String, Arc<dyn Consumer>>,
}

impl MediaTransportPair {
    pub fn send(&self) -> Option<Arc<dyn SendTransport>> {
        self.send.clone()
    }

    pub fn recv(&self) -> Option<Arc<dyn RecvTransport>> {
        self.recv.clone()
    }

    pub fn has_transports(&self) -> bool {
        self.send.is_some() || self.recv.is_some()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn producer_of_kind(&self, kind: MediaKind) -> Option<&Arc<dyn Producer>> {
        self.producers.values().find(|p| p.kind() == kind)
    }

    pub fn consumer(&self, id: &str) -> Option<&Arc<dyn Consumer>> {
        self.consumers.get(id)
    }

    pub(crate) fn insert_producer(&mut self, producer: Arc<dyn Producer>) {
        self.producers.insert(producer.id().to_string(), producer);
    }

    pub(crate) fn insert_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.insert(consumer.id().to_string(), consumer);
    }

    pub(crate) fn remove_consumer(&mut self, id: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.remove(id)
    }

    /// Close both transports, returning the ids of those that were open.
    pub(crate) fn close_transports(&mut self) -> Vec<String> {
        let mut closed = Vec::with_capacity(2);
        if let Some(send) = self.send.take() {
            send.close();
            closed.push(send.id().to_string());
        }
        if let Some(recv) = self.recv.take() {
            recv.close();
            closed.push(recv.id().to_string());
        }
        closed
    }

    /// Drop every producer and consumer handle.
    pub(crate) fn clear_handles(&mut self) {
        for producer in self.producers.drain().map(|(_, p)| p) {
            producer.close();
        }
        for consumer in self.consumers.drain().map(|(_, c)| c) {
            consumer.close();
        }
    }
}

/// Per-track result of publishing a local stream.
#[derive(Default)]
pub struct ProduceOutcome {
    pub producers: Vec<Arc<dyn Producer>>,
    pub failures: Vec<(MediaKind, String)>,
}

#[derive(Deserialize)]
struct ProducerCreated {
    id: String,
}

#[derive(Deserialize)]
struct ConsumerCreated {
    params: ConsumerParams,
}

/// Drives the media engine and the server-side negotiation for a call.
#[derive(Clone)]
pub struct MediaTransportManager {
    signaling: Arc<dyn Signaling>,
    engine: Arc<dyn MediaEngine>,
    video_min_bitrate: u32,
}

impl MediaTransportManager {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        engine: Arc<dyn MediaEngine>,
        video_min_bitrate: u32,
    ) -> Self {
        Self {
            signaling,
            engine,
            video_min_bitrate,
        }
    }

    /// Build the send and receive transports. Neither may exist yet.
    pub fn create_transports(
        &self,
        pair: &mut MediaTransportPair,
        send: &TransportParams,
        recv: &TransportParams,
    ) -> Result<(), CallError> {
        if pair.send.is_some() {
            return Err(CallError::TransportExists("send"));
        }
        if pair.recv.is_some() {
            return Err(CallError::TransportExists("recv"));
        }

        let hooks: Arc<dyn TransportHooks> = Arc::new(NegotiationBridge {
            signaling: self.signaling.clone(),
        });
        let send_transport = self.engine.create_send_transport(send, hooks.clone())?;
        let recv_transport = match self.engine.create_recv_transport(recv, hooks) {
            Ok(transport) => transport,
            Err(e) => {
                send_transport.close();
                return Err(e.into());
            }
        };
        debug!(
            target: "Calls/Media",
            "Created transports send={} recv={}",
            send_transport.id(),
            recv_transport.id()
        );
        pair.send = Some(send_transport);
        pair.recv = Some(recv_transport);
        Ok(())
    }

    pub async fn acquire_local_stream(
        &self,
        facing_mode: FacingMode,
    ) -> Result<LocalStream, MediaError> {
        self.engine
            .acquire_local_stream(MediaConstraints {
                audio: true,
                video: true,
                facing_mode,
            })
            .await
    }

    /// One producer per track. A track that fails is reported, not fatal by itself.
    pub async fn produce(
        &self,
        transport: Arc<dyn SendTransport>,
        stream: &LocalStream,
    ) -> ProduceOutcome {
        let mut outcome = ProduceOutcome::default();
        for track in stream.tracks() {
            let kind = track.kind();
            let options = ProduceOptions {
                min_bitrate: (kind == MediaKind::Video).then_some(self.video_min_bitrate),
                app_data: json!({ "kind": kind, "trackId": track.id() }),
            };
            match transport.produce(track.clone(), options).await {
                Ok(producer) => {
                    debug!(target: "Calls/Media", "Producing {kind} as {}", producer.id());
                    outcome.producers.push(producer);
                }
                Err(e) => {
                    warn!(target: "Calls/Media", "Failed to produce {kind}: {e}");
                    outcome.failures.push((kind, e.to_string()));
                }
            }
        }
        outcome
    }

    /// Ask the server for consumer parameters and build the (paused) consumer.
    pub async fn consume(
        &self,
        transport: Arc<dyn RecvTransport>,
        producer_id: &str,
    ) -> Result<Arc<dyn Consumer>, CallError> {
        let transport_id = transport.id().to_string();
        let answer = self
            .signaling
            .request(
                ClientEvent::CreateConsumer {
                    transport_id: transport_id.clone(),
                    producer_id: producer_id.to_string(),
                    rtp_capabilities: self.engine.rtp_capabilities(),
                },
                Some(&transport_id),
            )
            .await
            .map_err(NegotiationError::from)?;
        let created: ConsumerCreated = parse_ack(answer).map_err(NegotiationError::from)?;
        Ok(transport.consume(created.params).await?)
    }

    /// Ask the server to start forwarding to a consumer.
    pub async fn resume(&self, scope: &str, consumer_id: &str) -> Result<(), NegotiationError> {
        let answer = self
            .signaling
            .request(
                ClientEvent::ResumeConsumer {
                    consumer_id: consumer_id.to_string(),
                },
                Some(scope),
            )
            .await?;
        parse_ack::<IgnoredAny>(answer)?;
        Ok(())
    }
}

/// Engine-side negotiation hooks, answered through the signaling channel.
struct NegotiationBridge {
    signaling: Arc<dyn Signaling>,
}

#[async_trait]
impl TransportHooks for NegotiationBridge {
    async fn connect(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), NegotiationError> {
        let answer = self
            .signaling
            .request(
                ClientEvent::ConnectTransport {
                    transport_id: transport_id.to_string(),
                    dtls_parameters,
                },
                Some(transport_id),
            )
            .await?;
        parse_ack::<IgnoredAny>(answer)?;
        debug!(target: "Calls/Media", "Transport {transport_id} connected");
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        request: ProduceRequest,
    ) -> Result<String, NegotiationError> {
        let answer = self
            .signaling
            .request(
                ClientEvent::CreateProducer {
                    transport_id: transport_id.to_string(),
                    kind: request.kind,
                    rtp_parameters: request.rtp_parameters,
                    app_data: request.app_data,
                },
                Some(transport_id),
            )
            .await?;
        let created: ProducerCreated = parse_ack(answer)?;
        Ok(created.id)
    }
}
