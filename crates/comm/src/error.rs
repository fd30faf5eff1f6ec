//! Error types for PDP message dispatch.
//!
//! Errors fall into the categories the dispatch engine treats differently:
//!
//! - **Configuration errors** (broadcast or nameless requests, bad parameters)
//!   are returned synchronously from the submitting call and never enter the
//!   retry machinery.
//! - **Transport errors** (the outbound sink failed) are logged by the
//!   publisher; the request's timer drives a retry.
//! - **Collaborator errors** (topology, policy, status stores) are caught where
//!   they occur and logged; the affected cycle becomes a no-op.

use thiserror::Error;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, CommError>;

/// Errors that can occur while dispatching PDP messages.
#[derive(Debug, Error)]
pub enum CommError {
    // ===== Submission Errors =====
    /// A request addressed to every PDP was submitted where only per-PDP
    /// requests are managed.
    #[error("unexpected broadcast message: {0}")]
    UnexpectedBroadcast(String),

    /// A message or status lacked a required field.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    // ===== Transport Errors =====
    /// The outbound topic rejected a message.
    #[error("send failed on topic {topic}: {reason}")]
    SendFailed { topic: String, reason: String },

    /// A message could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Lifecycle Errors =====
    /// The component was already started.
    #[error("{0} already started")]
    AlreadyStarted(String),

    // ===== Configuration Errors =====
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    // ===== Collaborator Errors =====
    /// A store or repository failed.
    #[error(transparent)]
    Store(#[from] pap_common::Error),

    /// The status repository failed.
    #[error(transparent)]
    Notify(#[from] pap_notification::NotifyError),
}

impl CommError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CommError::SendFailed { .. } | CommError::Store(_))
    }
}
