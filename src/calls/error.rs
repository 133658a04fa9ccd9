//! Call-related error types.

use crate::calls::media::MediaError;
use crate::protocol::AckError;
use crate::request::RequestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no active call")]
    NoSession,

    #[error("a call is already in progress ({0:?})")]
    CallInProgress(super::state::LifecycleState),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("{0} transport already exists for this call")]
    TransportExists(&'static str),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("call manager has shut down")]
    Closed,
}

/// The server (or the channel) did not let a transport, producer or consumer through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("server refused: {0}")]
    Refused(String),

    #[error("malformed answer: {0}")]
    Malformed(String),
}

impl From<AckError> for NegotiationError {
    fn from(value: AckError) -> Self {
        match value {
            AckError::Refused(reason) => Self::Refused(reason),
            AckError::Malformed(reason) => Self::Malformed(reason),
        }
    }
}
