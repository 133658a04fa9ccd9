pub mod types {
    pub mod call;
    pub mod events;
}

pub mod calls;
pub mod channel;
pub mod client;
pub mod config;
pub mod credentials;
mod keepalive;
pub mod protocol;
pub mod request;
pub mod socket;
pub mod transport;

pub use calls::{CallCommand, CallHandle, CallSnapshot, ConnectionQuality, LifecycleState};
pub use channel::{ChannelError, ConnectionState, Signaling, SignalingChannel};
pub use client::Client;
pub use config::{CallConfig, ChannelConfig, ClientConfig};
pub use credentials::{Credential, CredentialError, CredentialProvider, StaticCredentials};
pub use types::call::{CallId, EndReason, RemoteParty};
