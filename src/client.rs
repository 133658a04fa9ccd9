use crate::calls::{CallHandle, CallManager, MediaEngine};
use crate::channel::{ChannelError, ConnectionState, SignalingChannel};
use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::transport::TransportFactory;
use crate::types::events::EventBus;
use log::info;
use std::sync::Arc;
use tokio::sync::watch;

/// Composition root: one signaling channel and the call manager fed by it.
pub struct Client {
    config: ClientConfig,
    channel: Arc<SignalingChannel>,
    calls: CallHandle,
    events: Arc<EventBus>,
}

impl Client {
    /// Must be called from within a tokio runtime; the call manager is spawned on it.
    pub async fn new(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialProvider>,
        media_engine: Arc<dyn MediaEngine>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let channel = SignalingChannel::new(
            config.server_url.clone(),
            config.channel.clone(),
            transport_factory,
            credentials,
            events.clone(),
        );
        let calls = CallManager::spawn(
            config.call.clone(),
            config.device_id.clone(),
            channel.clone(),
            media_engine,
            events.clone(),
        );
        channel.attach(calls.inbox()).await;

        Arc::new(Self {
            config,
            channel,
            calls,
            events,
        })
    }

    /// Connect and keep the channel up until [`disconnect`](Self::disconnect)
    /// or a terminal auth failure.
    pub async fn run(&self) {
        self.channel.attach(self.calls.inbox()).await;
        self.channel.run().await;
        info!("Client run loop has shut down.");
    }

    /// Open the channel once, without the reconnect loop.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.channel.attach(self.calls.inbox()).await;
        self.channel.connect().await
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.watch_state()
    }
}
