//! The signaling channel: one authenticated connection to the call server.
//!
//! [`SignalingChannel`] owns the live transport, keeps it alive, reconnects
//! after unexpected drops and forwards every pushed server event, untouched, to
//! the attached [`CallInbox`]. An auth rejection (at connect time or on a live
//! connection) triggers exactly one credential refresh and one retry; if that
//! fails too the channel gives up and reports [`ConnectFailure`].

use crate::calls::CallInbox;
use crate::config::ChannelConfig;
use crate::credentials::{Credential, CredentialError, CredentialProvider, CredentialRefresher};
use crate::protocol::{ClientEvent, ServerFrame};
use crate::request::{RequestError, RequestTable};
use crate::transport::{
    DisconnectReason, Transport, TransportError, TransportEvent, TransportFactory,
};
use crate::types::events::{ConnectFailure, Connected, Disconnected, Event, EventBus};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::Instant;

/// What the call layer needs from the channel.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Fire-and-forget notification.
    async fn emit(&self, event: ClientEvent) -> Result<(), RequestError>;

    /// Send a request and wait for its acknowledgment.
    ///
    /// `scope` ties the request to a media transport so that closing the
    /// transport can drop it with [`cancel_scope`](Self::cancel_scope).
    async fn request(&self, event: ClientEvent, scope: Option<&str>) -> Result<Value, RequestError>;

    async fn cancel_scope(&self, scope: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,
    #[error("server rejected the credential: {0}")]
    Unauthorized(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("authentication failed after credential refresh: {0}")]
    AuthFailed(String),
    #[error("channel is not connected")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection attempt aborted by disconnect")]
    Aborted,
}

impl ChannelError {
    /// The channel stops retrying after these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthFailed(_) | Self::Credential(_))
    }
}

impl From<TransportError> for ChannelError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Unauthorized(reason) => Self::Unauthorized(reason),
            other => Self::Transport(other),
        }
    }
}

pub struct SignalingChannel {
    url: String,
    pub(crate) config: ChannelConfig,
    factory: Arc<dyn TransportFactory>,
    credentials: CredentialRefresher,
    events: Arc<EventBus>,

    pub(crate) transport: Mutex<Option<Arc<dyn Transport>>>,
    transport_events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    requests: RequestTable,
    inbox: Mutex<Option<CallInbox>>,
    state_tx: watch::Sender<ConnectionState>,

    is_running: AtomicBool,
    is_connecting: AtomicBool,
    expected_disconnect: AtomicBool,
    pub enable_auto_reconnect: AtomicBool,
    reconnect_errors: AtomicU32,
    /// Bumped by every `disconnect`; a connect that started under an older
    /// value must not install its transport.
    disconnect_epoch: AtomicU64,
    /// Serializes the open-after-refresh step so only one fresh connection is made.
    reauth_lock: Mutex<()>,

    pub(crate) shutdown_notifier: Notify,
    /// Raised by keepalive when the server stopped answering pings.
    pub(crate) reconnect_notifier: Notify,
    pub(crate) last_pong: Mutex<Instant>,
    pub(crate) connection_generation: AtomicU64,
}

impl SignalingChannel {
    pub fn new(
        url: impl Into<String>,
        config: ChannelConfig,
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialProvider>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            config,
            factory,
            credentials: CredentialRefresher::new(credentials),
            events,
            transport: Mutex::new(None),
            transport_events: Mutex::new(None),
            requests: RequestTable::new(),
            inbox: Mutex::new(None),
            state_tx: watch::channel(ConnectionState::Disconnected).0,
            is_running: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            enable_auto_reconnect: AtomicBool::new(true),
            reconnect_errors: AtomicU32::new(0),
            disconnect_epoch: AtomicU64::new(0),
            reauth_lock: Mutex::new(()),
            shutdown_notifier: Notify::new(),
            reconnect_notifier: Notify::new(),
            last_pong: Mutex::new(Instant::now()),
            connection_generation: AtomicU64::new(0),
        })
    }

    /// Route pushed server events to `inbox` from now on.
    pub async fn attach(&self, inbox: CallInbox) {
        *self.inbox.lock().await = Some(inbox);
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Credential refreshes actually requested from the provider so far.
    pub fn refresh_count(&self) -> u64 {
        self.credentials.refresh_count()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(target: "Channel", "Connection state {current:?} -> {state:?}");
                *current = state;
                true
            }
        });
    }

    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Channel", "Channel `run` called while already running.");
            return;
        }
        while self.is_running.load(Ordering::Relaxed) {
            self.expected_disconnect.store(false, Ordering::Relaxed);

            match self.connect().await {
                Err(ChannelError::Aborted) => {
                    debug!(target: "Channel", "Connect aborted by disconnect.");
                }
                Err(e) if e.is_terminal() => {
                    error!(target: "Channel", "Giving up on the connection: {e}");
                    break;
                }
                Err(e) => error!(target: "Channel", "Failed to connect, will retry: {e}"),
                Ok(()) => match self.read_messages_loop().await {
                    Err(ChannelError::Unauthorized(reason)) => {
                        self.cleanup_connection_state().await;
                        let epoch = self.disconnect_epoch.load(Ordering::SeqCst);
                        match self.reauthenticate(reason, epoch).await {
                            Ok(()) => continue,
                            Err(e) if e.is_terminal() => {
                                error!(target: "Channel", "Giving up on the connection: {e}");
                                break;
                            }
                            Err(e) => warn!(target: "Channel", "Reconnect after auth rejection failed: {e}"),
                        }
                    }
                    Err(e) => {
                        warn!(target: "Channel", "Message loop exited with an error: {e}. Will attempt to reconnect if enabled.");
                        self.cleanup_connection_state().await;
                    }
                    Ok(()) => {
                        if self.expected_disconnect.load(Ordering::Relaxed) {
                            debug!(target: "Channel", "Message loop exited gracefully (expected disconnect).");
                        } else {
                            info!(target: "Channel", "Message loop exited gracefully.");
                        }
                        self.cleanup_connection_state().await;
                    }
                },
            }

            if !self.is_running.load(Ordering::Relaxed) {
                break;
            }
            if !self.enable_auto_reconnect.load(Ordering::Relaxed) {
                info!(target: "Channel", "Auto-reconnect disabled, shutting down.");
                break;
            }

            let error_count = self.reconnect_errors.fetch_add(1, Ordering::SeqCst);
            let delay = self.config.reconnect_delay(error_count);
            info!(
                target: "Channel",
                "Will attempt to reconnect in {:?} (attempt {})",
                delay,
                error_count + 1
            );
            let shutdown = self.shutdown_notifier.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();
            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown => {}
            }
        }
        self.is_running.store(false, Ordering::Relaxed);
        info!(target: "Channel", "Channel run loop has shut down.");
    }

    /// Open the channel with the provider's current credential. A no-op when connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Ok(());
        }
        let epoch = self.disconnect_epoch.load(Ordering::SeqCst);
        let credential = match self.credentials.current().await {
            Ok(credential) => credential,
            Err(e) => return self.reauthenticate(e.to_string(), epoch).await,
        };
        self.open_or_refresh(&credential, epoch).await
    }

    /// Open the channel with an explicit credential.
    pub async fn connect_with(
        self: &Arc<Self>,
        credential: &Credential,
    ) -> Result<(), ChannelError> {
        let epoch = self.disconnect_epoch.load(Ordering::SeqCst);
        self.open_or_refresh(credential, epoch).await
    }

    async fn open_or_refresh(
        self: &Arc<Self>,
        credential: &Credential,
        epoch: u64,
    ) -> Result<(), ChannelError> {
        match self.open(credential, epoch).await {
            Err(ChannelError::Unauthorized(reason)) => self.reauthenticate(reason, epoch).await,
            other => other,
        }
    }

    /// One refresh, one retry. Concurrent callers share the refresh.
    async fn reauthenticate(
        self: &Arc<Self>,
        reason: String,
        epoch: u64,
    ) -> Result<(), ChannelError> {
        info!(target: "Channel", "Credential rejected ({reason}), refreshing");
        self.set_state(ConnectionState::Connecting);
        let credential = match self.credentials.refresh().await {
            Ok(credential) => credential,
            Err(e) => return Err(self.fail_terminal(ChannelError::Credential(e))),
        };

        let _guard = self.reauth_lock.lock().await;
        if self.is_connected() {
            debug!(target: "Channel", "Another caller already reconnected with the fresh credential");
            return Ok(());
        }
        match self.open(&credential, epoch).await {
            Err(ChannelError::Unauthorized(reason)) => {
                Err(self.fail_terminal(ChannelError::AuthFailed(reason)))
            }
            other => other,
        }
    }

    fn fail_terminal(&self, e: ChannelError) -> ChannelError {
        self.set_state(ConnectionState::Disconnected);
        if self.enable_auto_reconnect.swap(false, Ordering::SeqCst) {
            error!(target: "Channel", "Connection failed permanently: {e}");
            self.events.dispatch(Event::ConnectFailure(ConnectFailure {
                message: e.to_string(),
            }));
        }
        e
    }

    async fn open(
        self: &Arc<Self>,
        credential: &Credential,
        epoch: u64,
    ) -> Result<(), ChannelError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::ConnectInProgress);
        }

        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        info!(target: "Channel", "Connecting to {}", self.url);
        let (transport, transport_events) =
            match self.factory.create_transport(&self.url, credential).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(target: "Channel", "Connect failed: {e}");
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e.into());
                }
            };

        // Held until the connection is fully installed so that `disconnect`
        // either aborts this attempt or sees the finished connection.
        let mut slot = self.transport.lock().await;
        if self.disconnect_epoch.load(Ordering::SeqCst) != epoch {
            drop(slot);
            info!(target: "Channel", "Disconnected while connecting, closing the new transport");
            transport.disconnect().await;
            self.set_state(ConnectionState::Disconnected);
            return Err(ChannelError::Aborted);
        }
        *slot = Some(transport);
        *self.transport_events.lock().await = Some(transport_events);
        *self.last_pong.lock().await = Instant::now();
        let generation = self.connection_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.reconnect_errors.store(0, Ordering::Relaxed);
        self.enable_auto_reconnect.store(true, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
        info!(target: "Channel", "Connected (generation {generation})");
        self.events.dispatch(Event::Connected(Connected));

        drop(slot);

        let channel = self.clone();
        tokio::spawn(async move { channel.keepalive_loop(generation).await });

        Ok(())
    }

    /// Close the channel. Nothing reaches the call inbox after this returns.
    pub async fn disconnect(&self) {
        info!(target: "Channel", "Disconnecting intentionally.");
        self.disconnect_epoch.fetch_add(1, Ordering::SeqCst);
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.is_running.store(false, Ordering::SeqCst);
        *self.inbox.lock().await = None;
        self.shutdown_notifier.notify_waiters();

        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
            self.events
                .dispatch(Event::Disconnected(Disconnected { expected: true }));
        }
        self.cleanup_connection_state().await;
    }

    async fn cleanup_connection_state(&self) {
        *self.transport.lock().await = None;
        *self.transport_events.lock().await = None;
        let cancelled = self.requests.cancel_all().await;
        if cancelled > 0 {
            debug!(target: "Channel", "Dropped {cancelled} unanswered request(s)");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn read_messages_loop(self: &Arc<Self>) -> Result<(), ChannelError> {
        info!(target: "Channel", "Starting message processing loop...");

        let mut transport_events = self
            .transport_events
            .lock()
            .await
            .take()
            .ok_or(ChannelError::NotConnected)?;

        // Registered before the check so a `disconnect` racing this start is not missed.
        let shutdown = self.shutdown_notifier.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if !self.is_running.load(Ordering::SeqCst) {
            info!(target: "Channel", "Channel stopped before the message loop started.");
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(target: "Channel", "Shutdown signaled in message loop. Exiting message loop.");
                    return Ok(());
                }
                _ = self.reconnect_notifier.notified() => {
                    self.drop_transport().await;
                    return Err(ChannelError::ConnectionLost("keepalive timeout".into()));
                }
                event = transport_events.recv() => match event {
                    Some(TransportEvent::TextReceived(text)) => {
                        if let Err(e) = self.handle_frame(&text).await {
                            self.drop_transport().await;
                            return Err(e);
                        }
                    }
                    Some(TransportEvent::Pong) => {
                        *self.last_pong.lock().await = Instant::now();
                    }
                    Some(TransportEvent::Connected) => {
                        debug!(target: "Channel", "Transport connected event received");
                    }
                    Some(TransportEvent::Disconnected(reason)) => {
                        return self.on_transport_closed(reason);
                    }
                    None => return self.on_transport_closed(DisconnectReason::Closed),
                }
            }
        }
    }

    /// Close the live transport ourselves, after an error the server did not report.
    async fn drop_transport(&self) {
        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.events
            .dispatch(Event::Disconnected(Disconnected { expected: false }));
    }

    fn on_transport_closed(&self, reason: DisconnectReason) -> Result<(), ChannelError> {
        let expected = self.expected_disconnect.load(Ordering::Relaxed);
        self.events
            .dispatch(Event::Disconnected(Disconnected { expected }));
        if expected {
            info!(target: "Channel", "Transport disconnected as expected.");
            return Ok(());
        }
        info!(target: "Channel", "Transport disconnected unexpectedly: {reason:?}");
        match reason {
            DisconnectReason::Unauthorized(reason) => Err(ChannelError::Unauthorized(reason)),
            DisconnectReason::Closed => {
                Err(ChannelError::ConnectionLost("closed by server".into()))
            }
            DisconnectReason::Error(e) => Err(ChannelError::ConnectionLost(e)),
        }
    }

    async fn handle_frame(&self, text: &str) -> Result<(), ChannelError> {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Channel", "Dropping malformed frame: {e}");
                return Ok(());
            }
        };

        match frame {
            ServerFrame::Ack { id, data } => {
                self.requests.resolve(id, data).await;
            }
            ServerFrame::Event(event) => {
                let name = event.name();
                let inbox = self.inbox.lock().await.clone();
                match inbox {
                    Some(inbox) => {
                        if !inbox.deliver(event) {
                            warn!(target: "Channel", "Call manager is gone, dropping {name}");
                        }
                    }
                    None => debug!(target: "Channel", "No subscriber, dropping {name}"),
                }
            }
            ServerFrame::AuthRejected(reason) => {
                warn!(target: "Channel", "Server rejected the credential mid-session: {reason}");
                return Err(ChannelError::Unauthorized(reason));
            }
            ServerFrame::Unknown(name) => {
                debug!(target: "Channel", "Ignoring unknown event {name}");
            }
        }
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), RequestError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(RequestError::NotConnected)?;
        transport.send_text(text).await.map_err(|e| {
            warn!(target: "Channel", "Send failed: {e}");
            RequestError::NotConnected
        })
    }
}

#[async_trait]
impl Signaling for SignalingChannel {
    async fn emit(&self, event: ClientEvent) -> Result<(), RequestError> {
        let text = event
            .encode(None)
            .map_err(|e| RequestError::Encode(e.to_string()))?;
        debug!(target: "Channel", "--> {}", event.name());
        self.send_text(text).await
    }

    async fn request(
        &self,
        event: ClientEvent,
        scope: Option<&str>,
    ) -> Result<Value, RequestError> {
        let (id, rx) = self.requests.register(scope).await;
        let text = match event.encode(Some(id)) {
            Ok(text) => text,
            Err(e) => {
                self.requests.forget(id).await;
                return Err(RequestError::Encode(e.to_string()));
            }
        };
        debug!(target: "Channel", "--> {} (#{id})", event.name());
        if let Err(e) = self.send_text(text).await {
            self.requests.forget(id).await;
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => {
                warn!(target: "Channel", "{} (#{id}) timed out", event.name());
                self.requests.forget(id).await;
                Err(RequestError::Timeout)
            }
        }
    }

    async fn cancel_scope(&self, scope: &str) {
        self.requests.cancel_scope(scope).await;
    }
}
