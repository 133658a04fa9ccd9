//! Bearer credentials and coalesced refresh.
//!
//! The [`CredentialProvider`] is an external collaborator (login flow, token
//! store). The channel only ever talks to it through a [`CredentialRefresher`],
//! which guarantees that concurrent auth failures share a single refresh.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} bytes>)", self.0.len())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credential available")]
    Missing,
    #[error("credential refresh is not supported by this provider")]
    RefreshUnavailable,
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}

/// Supplies and refreshes the bearer credential.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current_credential(&self) -> Result<Credential, CredentialError>;

    async fn refresh_credential(&self) -> Result<Credential, CredentialError>;
}

/// A fixed token that cannot be refreshed.
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current_credential(&self) -> Result<Credential, CredentialError> {
        if self.credential.token().is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(self.credential.clone())
    }

    async fn refresh_credential(&self) -> Result<Credential, CredentialError> {
        Err(CredentialError::RefreshUnavailable)
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, CredentialError>>>;

/// Single-flight wrapper around a [`CredentialProvider`].
///
/// While a refresh is in flight every caller of [`refresh`](Self::refresh)
/// awaits that same request. A failure that arrives after it completed starts
/// a new one.
pub struct CredentialRefresher {
    provider: Arc<dyn CredentialProvider>,
    in_flight: Mutex<Option<RefreshFuture>>,
    refreshes: AtomicU64,
}

impl CredentialRefresher {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            in_flight: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    pub async fn current(&self) -> Result<Credential, CredentialError> {
        self.provider.current_credential().await
    }

    pub async fn refresh(&self) -> Result<Credential, CredentialError> {
        let refresh = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!(target: "Credentials", "Joining in-flight credential refresh");
                    pending.clone()
                }
                None => {
                    let count = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(target: "Credentials", "Requesting credential refresh (#{count})");
                    let provider = self.provider.clone();
                    let pending = async move { provider.refresh_credential().await }
                        .boxed()
                        .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let result = refresh.clone().await;

        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|pending| pending.ptr_eq(&refresh)) {
            *slot = None;
        }
        drop(slot);

        if let Err(e) = &result {
            warn!(target: "Credentials", "Credential refresh failed: {e}");
        }
        result
    }

    /// Number of refresh requests actually sent to the provider.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}
