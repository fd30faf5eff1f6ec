//! Common error types for the policy administration crates.
//!
//! This module provides the unified error type [`enum@Error`] and the convenience
//! type alias [`Result`] used by the model types and by the collaborator
//! interfaces in [`crate::store`].
//!
//! Collaborator implementations (topology stores, policy repositories) report
//! their failures through this type so that callers in the dispatch engine can
//! tell a benign race ([`Error::AlreadyExists`]) from a genuine store failure.
//!
//! # Example
//!
//! ```rust
//! use pap_common::{Error, Result};
//!
//! fn validate_name(name: &str) -> Result<()> {
//!     if name.is_empty() {
//!         return Err(Error::InvalidData("PDP name cannot be empty".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for model and collaborator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid data error.
    ///
    /// Occurs when a message or model object fails validation.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The object being created already exists.
    ///
    /// Raised by stores when two coordinator replicas race to register the
    /// same PDP. Callers treat it as informational.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A backing store rejected or failed the operation.
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Returns true if this error reports a duplicate-key race.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }
}
