//! Ordered, idempotent teardown of a call's resources.

use super::quality::ConnectionQuality;
use super::state::{CallSession, LocalMediaFlags, RemoteMediaFlags};
use crate::config::CallConfig;
use crate::types::events::{CloseReason, Event, EventBus, SessionClosed};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// What cleanup released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Transports that were still open; pending negotiation on them must be cancelled.
    pub closed_transports: Vec<String>,
    pub stopped_tracks: usize,
}

pub struct CleanupCoordinator {
    config: CallConfig,
    events: Arc<EventBus>,
}

impl CleanupCoordinator {
    pub fn new(config: CallConfig, events: Arc<EventBus>) -> Self {
        Self { config, events }
    }

    /// Release everything the session holds and announce it closed.
    ///
    /// Returns `None` if the session was already torn down.
    pub fn teardown(
        &self,
        session: &mut CallSession,
        reason: CloseReason,
    ) -> Option<TeardownReport> {
        if session.closed {
            debug!(target: "Calls/Cleanup", "Session already torn down, skipping");
            return None;
        }

        let closed_transports = session.media.close_transports();
        session.media.clear_handles();
        let stopped_tracks = session
            .local_stream
            .take()
            .map(|stream| stream.stop())
            .unwrap_or(0);
        session.local_media = LocalMediaFlags::new(self.config.initial_facing_mode);
        session.remote_party = None;
        session.quality = ConnectionQuality::Unknown;
        session.remote_media = RemoteMediaFlags::default();

        session.closed = true;
        info!(
            target: "Calls/Cleanup",
            "Call {} torn down ({reason:?}): {} transport(s), {stopped_tracks} track(s)",
            session.call_id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
            closed_transports.len()
        );
        self.events.dispatch(Event::SessionClosed(SessionClosed {
            call_id: session.call_id.clone(),
            reason,
        }));

        Some(TeardownReport {
            closed_transports,
            stopped_tracks,
        })
    }

    /// How long a fatal error stays on screen, then how long until resources go.
    pub fn error_schedule(&self) -> (Duration, Duration) {
        (
            self.config.error_display_delay,
            self.config.error_teardown_delay,
        )
    }

    /// How long a non-completed "ended" status stays visible.
    pub fn ended_status_visibility(&self) -> Duration {
        self.config.ended_status_visibility
    }
}
