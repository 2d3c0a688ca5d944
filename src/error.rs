//! Error types for the escrow settlement engine
//!
//! One taxonomy for the whole crate: validation errors are rejected
//! synchronously, verification failures are retried up to a bound,
//! submission failures leave local state at its last-confirmed value,
//! and consistency failures halt a record until an administrator steps in.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Bad party identities, zero amounts, wrong caller
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transaction verification failures (amount/party/confirmation mismatch)
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Ledger submission failures (timeout, insufficient balance, revert)
    #[error("Ledger submission failed: {0}")]
    Submission(String),

    /// Local record disagrees with the ledger; never auto-corrected
    #[error("Consistency failure: {0}")]
    Consistency(String),

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Record or trade lookups that came up empty
    #[error("Not found: {0}")]
    NotFound(String),

    /// Dispute resolution errors
    #[error("Dispute error: {0}")]
    Dispute(String),

    /// Signing key errors on the custodial path
    #[error("Signer error: {0}")]
    Signer(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// UUID parsing errors
    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a verification error
    pub fn verification<S: Into<String>>(msg: S) -> Self {
        Self::Verification(msg.into())
    }

    /// Create a submission error
    pub fn submission<S: Into<String>>(msg: S) -> Self {
        Self::Submission(msg.into())
    }

    /// Create a consistency error
    pub fn consistency<S: Into<String>>(msg: S) -> Self {
        Self::Consistency(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a dispute error
    pub fn dispute<S: Into<String>>(msg: S) -> Self {
        Self::Dispute(msg.into())
    }

    /// Create a signer error
    pub fn signer<S: Into<String>>(msg: S) -> Self {
        Self::Signer(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure is worth another attempt (verification and
    /// submission failures are; everything else is not).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Verification(_) | Self::Submission(_))
    }
}
