//! Error types for the Warden engine.

use thiserror::Error;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// A policy is malformed or contradictory and was rejected at load time
    #[error("Invalid policy '{policy_id}': {reason}")]
    PolicyInvalid { policy_id: String, reason: String },

    /// The counter store could not be reached or did not answer in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encoding or decoding errors on the service surface
    #[error("Serialization error: {0}")]
    Serde(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Shorthand for building a [`WardenError::PolicyInvalid`].
    pub fn policy_invalid(policy_id: impl Into<String>, reason: impl Into<String>) -> Self {
        WardenError::PolicyInvalid {
            policy_id: policy_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Serde(e.to_string())
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
