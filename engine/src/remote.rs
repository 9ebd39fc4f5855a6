//! Remote data source collaborator.
//!
//! The engine is transport-agnostic: it talks to whatever backs
//! [`RemoteSource`] and only cares about the error class that comes back.
//! Timeouts are the implementor's concern; a timed-out call is reported as
//! [`RemoteError::Timeout`] and treated as transient.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from the remote collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("http status {0}")]
    Http(u16),
}

impl RemoteError {
    /// Transient failures are retried (outbox backoff) or degraded to a
    /// stale serve (orchestrator reads). Permanent failures are surfaced
    /// immediately and never retried.
    ///
    /// 408 (request timeout) and 429 (rate limited) are the retryable 4xx.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Timeout | RemoteError::Network(_) => true,
            RemoteError::Http(status) => *status >= 500 || *status == 408 || *status == 429,
        }
    }
}

/// A mutation destined for the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Logical resource the mutation targets
    pub resource: String,
    /// Mutation payload, interpreted by the remote
    pub payload: Value,
}

impl Action {
    /// Create a new action.
    pub fn new(resource: impl Into<String>, payload: Value) -> Self {
        Self {
            resource: resource.into(),
            payload,
        }
    }
}

/// The remote data source the engine syncs against.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch the current bytes for a resource, in the codec wire format.
    async fn fetch(&self, resource: &str) -> Result<Vec<u8>, RemoteError>;

    /// Submit a mutation. `Ok(())` is the remote's acknowledgment.
    async fn submit(&self, action: &Action) -> Result<(), RemoteError>;
}
