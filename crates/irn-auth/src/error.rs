//! Error types for the authentication module.

use thiserror::Error;

use irn_core::NodeId;

/// Errors that can occur during identity, challenge or session operations.
///
/// Expected protocol failures (bad signature, expired challenge, rate limit)
/// are outcome values, not errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The node is not in the registry.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A configured duration is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] irn_store::StoreError),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] irn_core::CoreError),
}

/// Result type for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
