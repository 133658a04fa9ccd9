use crate::types::call::{CallId, EndReason};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The signaling channel is up and authenticated.
#[derive(Debug, Clone)]
pub struct Connected;

/// The signaling channel went down.
#[derive(Debug, Clone)]
pub struct Disconnected {
    pub expected: bool,
}

/// The channel gave up: credential refresh failed or the fresh credential was
/// rejected too. No automatic reconnect follows.
#[derive(Debug, Clone)]
pub struct ConnectFailure {
    pub message: String,
}

/// A fatal call error, shown to the user before the call is torn down.
#[derive(Debug, Clone)]
pub struct CallFailed {
    pub call_id: Option<CallId>,
    pub message: String,
}

/// The error display window is over; the UI goes back to the pre-call screen.
#[derive(Debug, Clone)]
pub struct ErrorDismissed {
    pub call_id: Option<CallId>,
}

/// A failure that was absorbed without interrupting the call.
#[derive(Debug, Clone)]
pub struct NonFatalError {
    pub call_id: Option<CallId>,
    pub message: String,
}

/// Emitted exactly once per call, after cleanup ran.
#[derive(Debug, Clone)]
pub struct SessionClosed {
    pub call_id: Option<CallId>,
    pub reason: CloseReason,
}

/// A local command that is not valid in the current call state.
#[derive(Debug, Clone)]
pub struct CommandRejected {
    pub command: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Ended(EndReason),
    HungUp,
    Failed(String),
}

// Macro to generate the Event enum, EventBus fields and dispatch
macro_rules! define_event_bus {
    ($(($field:ident, $variant:ident)),* $(,)?) => {
        #[derive(Debug, Clone)]
        pub enum Event {
            $(
                $variant($variant),
            )*
        }

        /// Typed event bus with a separate broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<Arc<$variant>>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }

            /// Publish an event. Events without subscribers are dropped.
            pub fn dispatch(&self, event: Event) {
                match event {
                    $(
                        Event::$variant(inner) => {
                            let _ = self.$field.send(Arc::new(inner));
                        }
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Connection events
    (connected, Connected),
    (disconnected, Disconnected),
    (connect_failure, ConnectFailure),

    // Call events
    (call_failed, CallFailed),
    (error_dismissed, ErrorDismissed),
    (non_fatal_error, NonFatalError),
    (session_closed, SessionClosed),
    (command_rejected, CommandRejected),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
