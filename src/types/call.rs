use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned call identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The other participant of a call: either a saved contact or a bare user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteParty {
    #[serde(rename_all = "camelCase")]
    Contact {
        user_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    User { user_id: String },
}

impl RemoteParty {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
        }
    }

    pub fn contact(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::Contact {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Contact { user_id, .. } | Self::User { user_id } => user_id,
        }
    }
}

/// Why the server ended a call.
///
/// Only `Completed` resets the session right away; every other reason keeps
/// an "ended" status visible for a while.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EndReason {
    Completed,
    Rejected,
    Busy,
    Missed,
    Cancelled,
    Other(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
            Self::Other(reason) => reason,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl From<String> for EndReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "completed" => Self::Completed,
            "rejected" => Self::Rejected,
            "busy" => Self::Busy,
            "missed" => Self::Missed,
            "cancelled" => Self::Cancelled,
            _ => Self::Other(value),
        }
    }
}

impl From<EndReason> for String {
    fn from(value: EndReason) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
