//! Pending acknowledgment table.
//!
//! Every request that expects an answer gets a numeric id and a oneshot
//! waiter. Waiters may be scoped (the media transport id) so that tearing a
//! transport down drops every negotiation still waiting on it. An answer that
//! arrives for an id that is no longer in the table is discarded.

use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("channel is not connected")]
    NotConnected,
    #[error("request was cancelled before an answer arrived")]
    Cancelled,
    #[error("could not encode request: {0}")]
    Encode(String),
}

struct Waiter {
    scope: Option<String>,
    tx: oneshot::Sender<Value>,
}

#[derive(Default)]
pub struct RequestTable {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and register its waiter.
    pub async fn register(&self, scope: Option<&str>) -> (u64, oneshot::Receiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(
            id,
            Waiter {
                scope: scope.map(str::to_owned),
                tx,
            },
        );
        (id, rx)
    }

    /// Hand an acknowledgment to its waiter. Returns false if nobody was waiting.
    pub async fn resolve(&self, id: u64, data: Value) -> bool {
        let Some(waiter) = self.waiters.lock().await.remove(&id) else {
            debug!(target: "Channel/Requests", "Dropping ack {id}: no pending request");
            return false;
        };
        if waiter.tx.send(data).is_err() {
            warn!(target: "Channel/Requests", "Failed to deliver ack {id}. Receiver was likely dropped.");
        }
        true
    }

    /// Forget a request without resolving it (timeout, send failure).
    pub async fn forget(&self, id: u64) {
        self.waiters.lock().await.remove(&id);
    }

    /// Drop every waiter registered under `scope`; their requests fail with `Cancelled`.
    pub async fn cancel_scope(&self, scope: &str) -> usize {
        let mut waiters = self.waiters.lock().await;
        let before = waiters.len();
        waiters.retain(|_, waiter| waiter.scope.as_deref() != Some(scope));
        let cancelled = before - waiters.len();
        if cancelled > 0 {
            debug!(target: "Channel/Requests", "Cancelled {cancelled} pending request(s) for {scope}");
        }
        cancelled
    }

    pub async fn cancel_all(&self) -> usize {
        let mut waiters = self.waiters.lock().await;
        let cancelled = waiters.len();
        waiters.clear();
        cancelled
    }

    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}
