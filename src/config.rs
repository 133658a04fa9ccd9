use crate::calls::FacingMode;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket URL of the signaling server, e.g. `wss://sfu.example.com/ws`.
    pub server_url: String,
    /// Sent with `answer-call` so the server knows which device picked up.
    pub device_id: String,
    pub channel: ChannelConfig,
    pub call: CallConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000/ws".to_string(),
            device_id: "default".to_string(),
            channel: ChannelConfig::default(),
            call: CallConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// How long a request waits for its acknowledgment.
    pub request_timeout: Duration,
    /// Added per failed reconnect attempt.
    pub reconnect_step: Duration,
    /// Upper bound for the reconnect backoff.
    pub max_reconnect_delay: Duration,
    pub keepalive_interval_min: Duration,
    pub keepalive_interval_max: Duration,
    /// Without a pong for this long the channel is force-closed.
    pub keepalive_max_fail_time: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            reconnect_step: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(30),
            keepalive_interval_min: Duration::from_secs(20),
            keepalive_interval_max: Duration::from_secs(30),
            keepalive_max_fail_time: Duration::from_secs(180),
        }
    }
}

impl ChannelConfig {
    /// Linear backoff for the `attempt`-th consecutive failure, capped.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_step
            .saturating_mul(attempt)
            .min(self.max_reconnect_delay)
    }
}

#[derive(Clone, Debug)]
pub struct CallConfig {
    /// How long a non-completed "ended" status stays visible before reset.
    pub ended_status_visibility: Duration,
    /// How long a call error stays on screen.
    pub error_display_delay: Duration,
    /// Wait after the display window before resources are torn down.
    pub error_teardown_delay: Duration,
    /// Minimum bitrate hint for the video producer, in bits per second.
    pub video_min_bitrate: u32,
    pub initial_facing_mode: FacingMode,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ended_status_visibility: Duration::from_secs(3),
            error_display_delay: Duration::from_secs(1),
            error_teardown_delay: Duration::from_secs(2),
            video_min_bitrate: 100_000,
            initial_facing_mode: FacingMode::User,
        }
    }
}
