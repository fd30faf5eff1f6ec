//! Error types for deployment status tracking.

use thiserror::Error;

/// Result type for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Errors raised while loading or persisting deployment records.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The status repository failed.
    #[error("status repository error: {0}")]
    Repository(String),

    /// A collaborator reported a common error.
    #[error(transparent)]
    Common(#[from] pap_common::Error),
}
