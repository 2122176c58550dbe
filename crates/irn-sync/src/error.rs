//! Error types for the sync module.

use thiserror::Error;

use irn_core::{ErrorCode, NodeId};

/// Errors that can occur during export, pull or import.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The target node is not registered.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The target node is not `Authorized`.
    #[error("node {0} is not authorized")]
    NodeNotAuthorized(NodeId),

    /// The target node has no URL to pull from.
    #[error("node {0} has no url")]
    MissingNodeUrl(NodeId),

    /// An entity could not be converted to or from its stored form.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    /// Transport-level failure talking to the remote node.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The remote node answered with an error envelope.
    #[error("remote error ({code}): {message}")]
    Remote {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] irn_store::StoreError),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } | SyncError::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidEntity(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
