//! Call state machine implementation.

use serde::Serialize;

use super::media::{FacingMode, LocalStream, MediaKind};
use super::quality::ConnectionQuality;
use super::transport::MediaTransportPair;
use crate::config::CallConfig;
use crate::types::call::{CallId, EndReason, RemoteParty};

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LifecycleState {
    /// No call, or an answer has been sent and the server has not joined us yet.
    #[default]
    Idle,
    /// Outgoing call: `call-user` sent, waiting for the server to set the call up.
    Dialing,
    /// Outgoing call: transports exist, the remote side is ringing.
    Ringing,
    /// Remote side answered, local producers are being created.
    Connecting,
    /// Media flowing both ways.
    Ongoing,
    /// Torn down; an "ended" status may still be visible.
    Ending,
    /// A fatal error is being shown before the call is torn down.
    ErrorRecovery,
}

impl LifecycleState {
    /// Dialing through Ongoing.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Dialing | Self::Ringing | Self::Connecting | Self::Ongoing
        )
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::Ending | Self::ErrorRecovery)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    Dial,
    CallStarted,
    CallAnswered,
    CallJoined,
    ProducersReady,
    Ended,
    LocalHangUp,
    Failed,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFlag {
    #[default]
    Active,
    Paused,
}

/// What the remote party is currently sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RemoteMediaFlags {
    pub audio: MediaFlag,
    pub video: MediaFlag,
}

impl RemoteMediaFlags {
    pub fn set(&mut self, kind: MediaKind, flag: MediaFlag) {
        match kind {
            MediaKind::Audio => self.audio = flag,
            MediaKind::Video => self.video = flag,
        }
    }

    pub fn get(&self, kind: MediaKind) -> MediaFlag {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

/// Local toggles. Reset by cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LocalMediaFlags {
    pub mic_muted: bool,
    pub camera_off: bool,
    pub facing_mode: FacingMode,
}

impl LocalMediaFlags {
    pub fn new(facing_mode: FacingMode) -> Self {
        Self {
            mic_muted: false,
            camera_off: false,
            facing_mode,
        }
    }

    pub fn is_disabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.mic_muted,
            MediaKind::Video => self.camera_off,
        }
    }
}

/// The live call. Owned by the call manager; nothing else mutates it.
pub struct CallSession {
    /// Distinguishes this session from earlier ones in async completions.
    pub(crate) epoch: u64,
    pub(crate) call_id: Option<CallId>,
    pub(crate) state: LifecycleState,
    pub(crate) remote_party: Option<RemoteParty>,
    pub(crate) quality: ConnectionQuality,
    pub(crate) remote_media: RemoteMediaFlags,
    pub(crate) local_media: LocalMediaFlags,
    pub(crate) media: MediaTransportPair,
    pub(crate) local_stream: Option<LocalStream>,
    pub(crate) ready_sent: bool,
    pub(crate) ended_reason: Option<EndReason>,
    /// Message on screen while the error is visible.
    pub(crate) error: Option<String>,
    /// Why the call failed, kept after the message is dismissed.
    pub(crate) failure: Option<String>,
    /// Set once cleanup has run and `SessionClosed` went out.
    pub(crate) closed: bool,
}

impl CallSession {
    pub fn new(epoch: u64, config: &CallConfig) -> Self {
        Self {
            epoch,
            call_id: None,
            state: LifecycleState::Idle,
            remote_party: None,
            quality: ConnectionQuality::Unknown,
            remote_media: RemoteMediaFlags::default(),
            local_media: LocalMediaFlags::new(config.initial_facing_mode),
            media: MediaTransportPair::default(),
            local_stream: None,
            ready_sent: false,
            ended_reason: None,
            error: None,
            failure: None,
            closed: false,
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_ringing(&self) -> bool {
        self.state == LifecycleState::Ringing
    }

    pub fn media(&self) -> &MediaTransportPair {
        &self.media
    }

    /// False when the event names a different call than the live one.
    pub fn matches(&self, call_id: Option<&CallId>) -> bool {
        match (self.call_id.as_ref(), call_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        use LifecycleState::*;
        let next = match (self.state, transition) {
            (Idle, CallTransition::Dial) => Dialing,
            (Idle | Dialing, CallTransition::CallStarted) => Ringing,
            (Ringing, CallTransition::CallAnswered) => Connecting,
            (Idle | Dialing, CallTransition::CallJoined) => Ongoing,
            (Connecting, CallTransition::ProducersReady) => Ongoing,
            (Dialing | Ringing | Connecting | Ongoing, CallTransition::Ended) => Ending,
            (Dialing | Ringing | Connecting | Ongoing, CallTransition::Failed) => ErrorRecovery,
            (state, CallTransition::LocalHangUp) if state != Ending => Ending,
            (Ending | ErrorRecovery, CallTransition::Reset) => Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        self.state = next;
        Ok(())
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            state: self.state,
            is_ringing: self.is_ringing(),
            remote_party: self.remote_party.clone(),
            connection_quality: self.quality,
            remote_media: self.remote_media,
            local_media: self.local_media,
            ended_reason: self.ended_reason.clone(),
            error: self.error.clone(),
        }
    }
}

/// Read-only view of the call, published after every processed input.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_id: Option<CallId>,
    pub state: LifecycleState,
    pub is_ringing: bool,
    pub remote_party: Option<RemoteParty>,
    pub connection_quality: ConnectionQuality,
    pub remote_media: RemoteMediaFlags,
    pub local_media: LocalMediaFlags,
    pub ended_reason: Option<EndReason>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(1, &CallConfig::default())
    }

    /// Flow: Idle → Dialing → Ringing → Connecting → Ongoing → Ending → Idle
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = session();
        assert_eq!(call.state(), LifecycleState::Idle);

        call.apply_transition(CallTransition::Dial).unwrap();
        assert_eq!(call.state(), LifecycleState::Dialing);

        call.apply_transition(CallTransition::CallStarted).unwrap();
        assert!(call.is_ringing());

        call.apply_transition(CallTransition::CallAnswered).unwrap();
        assert_eq!(call.state(), LifecycleState::Connecting);
        assert!(!call.is_ringing());

        call.apply_transition(CallTransition::ProducersReady).unwrap();
        assert_eq!(call.state(), LifecycleState::Ongoing);

        call.apply_transition(CallTransition::Ended).unwrap();
        call.apply_transition(CallTransition::Reset).unwrap();
        assert_eq!(call.state(), LifecycleState::Idle);
    }

    /// Flow: Idle → Ongoing (callee joined)
    #[test]
    fn test_callee_joins_directly() {
        let mut call = session();
        call.apply_transition(CallTransition::CallJoined).unwrap();
        assert_eq!(call.state(), LifecycleState::Ongoing);
    }

    #[test]
    fn test_errors_reach_recovery_from_active_states() {
        for path in [
            &[CallTransition::Dial][..],
            &[CallTransition::Dial, CallTransition::CallStarted],
            &[
                CallTransition::Dial,
                CallTransition::CallStarted,
                CallTransition::CallAnswered,
            ],
        ] {
            let mut call = session();
            for step in path {
                call.apply_transition(*step).unwrap();
            }
            call.apply_transition(CallTransition::Failed).unwrap();
            assert_eq!(call.state(), LifecycleState::ErrorRecovery);
            call.apply_transition(CallTransition::Reset).unwrap();
            assert_eq!(call.state(), LifecycleState::Idle);
        }
    }

    #[test]
    fn test_hang_up_from_anywhere_but_ending() {
        let mut call = session();
        call.apply_transition(CallTransition::LocalHangUp).unwrap();
        assert_eq!(call.state(), LifecycleState::Ending);
        assert!(call.apply_transition(CallTransition::LocalHangUp).is_err());

        let mut call = session();
        call.apply_transition(CallTransition::Dial).unwrap();
        call.apply_transition(CallTransition::Failed).unwrap();
        call.apply_transition(CallTransition::LocalHangUp).unwrap();
        assert_eq!(call.state(), LifecycleState::Ending);
    }

    #[test]
    fn test_ended_call_never_rings_again() {
        let mut call = session();
        call.apply_transition(CallTransition::Dial).unwrap();
        call.apply_transition(CallTransition::Ended).unwrap();

        let err = call
            .apply_transition(CallTransition::CallStarted)
            .unwrap_err();
        assert_eq!(err.current_state, "Ending");
        assert!(call.apply_transition(CallTransition::Dial).is_err());
        assert!(call.apply_transition(CallTransition::Ended).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut call = session();
        assert!(call.apply_transition(CallTransition::CallAnswered).is_err());
        assert!(call.apply_transition(CallTransition::ProducersReady).is_err());
        assert!(call.apply_transition(CallTransition::Ended).is_err());
        assert!(call.apply_transition(CallTransition::Reset).is_err());
        assert_eq!(call.state(), LifecycleState::Idle);
    }

    #[test]
    fn test_call_id_matching() {
        let mut call = session();
        assert!(call.matches(Some(&CallId::new("c1"))));
        call.call_id = Some(CallId::new("c1"));
        assert!(call.matches(None));
        assert!(call.matches(Some(&CallId::new("c1"))));
        assert!(!call.matches(Some(&CallId::new("c2"))));
    }

    #[test]
    fn test_snapshot_reflects_session() {
        let mut call = session();
        call.call_id = Some(CallId::new("c1"));
        call.apply_transition(CallTransition::Dial).unwrap();
        call.apply_transition(CallTransition::CallStarted).unwrap();
        call.remote_media.set(MediaKind::Video, MediaFlag::Paused);

        let snapshot = call.snapshot();
        assert!(snapshot.is_ringing);
        assert_eq!(snapshot.state, LifecycleState::Ringing);
        assert_eq!(snapshot.remote_media.video, MediaFlag::Paused);
        assert_eq!(snapshot.remote_media.audio, MediaFlag::Active);
        assert_eq!(snapshot.connection_quality, ConnectionQuality::Unknown);
    }
}
