use async_trait::async_trait;
use sfu_call::channel::{ConnectionState, SignalingChannel};
use sfu_call::config::ChannelConfig;
use sfu_call::credentials::{Credential, CredentialError, CredentialProvider};
use sfu_call::transport::{
    DisconnectReason, Transport, TransportError, TransportEvent, TransportFactory,
};
use sfu_call::types::events::EventBus;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Hands out `t1` until refreshed; each refresh takes a while and mints a new token.
struct SlowRefreshProvider {
    refreshes: AtomicU32,
    fail: bool,
}

impl SlowRefreshProvider {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            refreshes: AtomicU32::new(0),
            fail,
        })
    }
}

#[async_trait]
impl CredentialProvider for SlowRefreshProvider {
    async fn current_credential(&self) -> Result<Credential, CredentialError> {
        Ok(Credential::new("t1"))
    }

    async fn refresh_credential(&self) -> Result<Credential, CredentialError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(150)).await;
        if self.fail {
            return Err(CredentialError::RefreshFailed("refresh token expired".into()));
        }
        Ok(Credential::new(format!("fresh-{n}")))
    }
}

struct QuietTransport {
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for QuietTransport {
    async fn send_text(&self, _text: String) -> Result<(), TransportError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let _ = self.events.send(TransportEvent::Pong).await;
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self
            .events
            .try_send(TransportEvent::Disconnected(DisconnectReason::Closed));
    }
}

/// Accepts any token not revoked; remembers every attempt.
#[derive(Default)]
struct RevokingFactory {
    revoked: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    live: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl RevokingFactory {
    fn revoke(&self, token: &str) {
        self.revoked.lock().unwrap().insert(token.to_string());
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    async fn kick(&self, reason: DisconnectReason) {
        let tx = self.live.lock().unwrap().clone().unwrap();
        tx.send(TransportEvent::Disconnected(reason)).await.unwrap();
    }
}

#[async_trait]
impl TransportFactory for RevokingFactory {
    async fn create_transport(
        &self,
        _url: &str,
        credential: &Credential,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        let token = credential.token().to_string();
        self.attempts.lock().unwrap().push(token.clone());
        if self.revoked.lock().unwrap().contains(&token) {
            return Err(TransportError::Unauthorized("upgrade refused with 401".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.live.lock().unwrap() = Some(tx.clone());
        Ok((Arc::new(QuietTransport { events: tx }), rx))
    }
}

fn channel(
    factory: Arc<RevokingFactory>,
    provider: Arc<SlowRefreshProvider>,
) -> (Arc<SignalingChannel>, Arc<EventBus>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let events = Arc::new(EventBus::new());
    let channel = SignalingChannel::new(
        "ws://sfu.test/ws",
        ChannelConfig::default(),
        factory,
        provider,
        events.clone(),
    );
    (channel, events)
}

async fn wait_for_state(
    channel: &SignalingChannel,
    predicate: impl FnMut(&ConnectionState) -> bool,
) {
    let mut state = channel.watch_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(predicate))
        .await
        .expect("state change in time")
        .unwrap();
}

#[tokio::test]
async fn test_auth_failure_during_reconnect_and_concurrent_connect_share_one_refresh() {
    let factory = Arc::new(RevokingFactory::default());
    let provider = SlowRefreshProvider::new(false);
    let (channel, _) = channel(factory.clone(), provider.clone());

    let runner = channel.clone();
    tokio::spawn(async move { runner.run().await });
    wait_for_state(&channel, |s| *s == ConnectionState::Connected).await;

    factory.revoke("t1");
    factory
        .kick(DisconnectReason::Unauthorized("token revoked".into()))
        .await;
    wait_for_state(&channel, |s| *s != ConnectionState::Connected).await;

    // A second caller hits the same rejection while the run loop is refreshing.
    channel.connect().await.unwrap();
    wait_for_state(&channel, |s| *s == ConnectionState::Connected).await;

    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(channel.refresh_count(), 1);
    let fresh_attempts = factory
        .attempts()
        .iter()
        .filter(|token| token.starts_with("fresh"))
        .count();
    assert_eq!(fresh_attempts, 1);

    channel.disconnect().await;
}

#[tokio::test]
async fn test_concurrent_initial_connects_share_one_refresh() {
    let factory = Arc::new(RevokingFactory::default());
    factory.revoke("t1");
    let provider = SlowRefreshProvider::new(false);
    let (channel, _) = channel(factory.clone(), provider.clone());

    let (a, b, c) = tokio::join!(channel.connect(), channel.connect(), channel.connect());

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert!(channel.is_connected());
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    channel.disconnect().await;
}

#[tokio::test]
async fn test_refresh_failure_stops_the_run_loop() {
    let factory = Arc::new(RevokingFactory::default());
    factory.revoke("t1");
    let provider = SlowRefreshProvider::new(true);
    let (channel, events) = channel(factory.clone(), provider.clone());
    let mut failures = events.connect_failure.subscribe();

    tokio::time::timeout(Duration::from_secs(5), channel.run())
        .await
        .expect("run loop exits on its own");

    assert_eq!(factory.attempts(), vec!["t1"]);
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    assert!(failures.recv().await.unwrap().message.contains("refresh token expired"));
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_plain_drop_reconnects_without_refresh() {
    let factory = Arc::new(RevokingFactory::default());
    let provider = SlowRefreshProvider::new(false);
    let (channel, events) = channel(factory.clone(), provider.clone());
    let mut disconnected = events.disconnected.subscribe();

    let runner = channel.clone();
    tokio::spawn(async move { runner.run().await });
    wait_for_state(&channel, |s| *s == ConnectionState::Connected).await;

    factory
        .kick(DisconnectReason::Error("connection reset".into()))
        .await;
    assert!(!disconnected.recv().await.unwrap().expected);
    for _ in 0..250 {
        if factory.attempts().len() == 2 && channel.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(factory.attempts(), vec!["t1", "t1"]);
    assert!(channel.is_connected());
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 0);
    channel.disconnect().await;
}
