//! Call session orchestration.
//!
//! # Architecture
//!
//! - [`CallManager`]: single owner of the live [`CallSession`]; consumes server
//!   events, local commands and async completions one at a time from a queue
//! - [`CallSession`] & [`LifecycleState`]: the call state machine
//! - [`MediaTransportManager`]: builds transports, producers and consumers
//!   through the external [`MediaEngine`], negotiating over the signaling channel
//! - [`CleanupCoordinator`]: ordered, idempotent teardown
//! - [`classify`]: transport score to [`ConnectionQuality`]
//!
//! Async work (media capture, producer and consumer negotiation, timers) runs
//! in spawned tasks that post a completion back into the queue, tagged with the
//! session epoch. A completion for a session that is gone, or for a handle
//! that cleanup already dropped, is a no-op.

mod cleanup;
mod error;
mod manager;
pub mod media;
mod quality;
mod state;
mod transport;

pub use cleanup::{CleanupCoordinator, TeardownReport};
pub use error::{CallError, NegotiationError};
pub use manager::{CallCommand, CallHandle, CallInbox, CallManager};
pub use media::{FacingMode, MediaEngine, MediaKind};
pub use quality::{ConnectionQuality, classify};
pub use state::{
    CallSession, CallSnapshot, CallTransition, InvalidTransition, LifecycleState,
    LocalMediaFlags, MediaFlag, RemoteMediaFlags,
};
pub use transport::{MediaTransportManager, MediaTransportPair, ProduceOutcome};
