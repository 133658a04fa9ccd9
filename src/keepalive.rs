use crate::channel::SignalingChannel;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

impl SignalingChannel {
    fn keepalive_interval(&self) -> Duration {
        let min = self.config.keepalive_interval_min.as_millis() as u64;
        let max = (self.config.keepalive_interval_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Sends a single ping. Returns false if the socket refused it.
    async fn send_ping(&self) -> bool {
        let Some(transport) = self.transport.lock().await.clone() else {
            return false;
        };
        debug!(target: "Channel/Keepalive", "Sending keepalive ping");
        match transport.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "Channel/Keepalive", "Keepalive ping failed: {e}");
                false
            }
        }
    }

    /// Pings the server for one connection. This should be spawned as a background task.
    ///
    /// Exits when the connection it was started for is gone. If no pong has
    /// arrived for `keepalive_max_fail_time`, the read loop is told to drop the
    /// connection so the run loop reconnects.
    pub(crate) async fn keepalive_loop(self: Arc<Self>, generation: u64) {
        loop {
            let interval = self.keepalive_interval();

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !self.is_connected()
                        || self.connection_generation.load(Ordering::SeqCst) != generation
                    {
                        debug!(target: "Channel/Keepalive", "Connection {generation} is gone, exiting keepalive loop.");
                        return;
                    }

                    let silent_for = self.last_pong.lock().await.elapsed();
                    if silent_for > self.config.keepalive_max_fail_time {
                        warn!(
                            target: "Channel/Keepalive",
                            "No pong for {} seconds, forcing reconnect.",
                            silent_for.as_secs()
                        );
                        self.reconnect_notifier.notify_one();
                        return;
                    }

                    if !self.send_ping().await {
                        info!(target: "Channel/Keepalive", "Ping not sent, will retry on the next tick.");
                    }
                },
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Channel/Keepalive", "Shutdown signaled, exiting keepalive loop.");
                    return;
                }
            }
        }
    }
}
