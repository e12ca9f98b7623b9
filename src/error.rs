//! Domain error taxonomy for the operational/settlement subsystem.
//!
//! Validation and precondition failures are surfaced to the caller and never
//! retried. Resolution and settlement failures are captured per refund record
//! and do not abort a batch. Lock contention skips the whole batch and is safe
//! to retry on the next trigger. Invariant violations (payout sum mismatch)
//! panic - they indicate a logic defect, not an external failure.

use std::fmt;

#[derive(Debug)]
pub enum OpsError {
    /// Bad input: reason too short, invalid participant list, amount out of range.
    Validation(String),
    /// Operation not applicable in the current state: already enabled, no
    /// active round, round not cancelled. The operation is a no-op.
    Precondition(String),
    /// The payer's settlement destination could not be resolved.
    Resolution(String),
    /// The payment channel rejected or failed to confirm a transfer.
    Settlement {
        message: String,
        /// Operator wallet cannot cover the transfer - distinguished so the
        /// admin surface can hint at a top-up instead of a contract issue.
        balance_shortfall: bool,
    },
    /// Another invocation holds the settlement lock. Zero work was done.
    LockContention(String),
    NotFound(String),
    /// Store/database failure. Carries the underlying anyhow chain.
    Internal(anyhow::Error),
}

impl OpsError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn settlement(msg: impl Into<String>) -> Self {
        Self::Settlement {
            message: msg.into(),
            balance_shortfall: false,
        }
    }

    pub fn balance_shortfall(msg: impl Into<String>) -> Self {
        Self::Settlement {
            message: msg.into(),
            balance_shortfall: true,
        }
    }
}

impl fmt::Display for OpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsError::Validation(msg) => write!(f, "validation: {msg}"),
            OpsError::Precondition(msg) => write!(f, "precondition: {msg}"),
            OpsError::Resolution(msg) => write!(f, "resolution: {msg}"),
            OpsError::Settlement {
                message,
                balance_shortfall,
            } => {
                if *balance_shortfall {
                    write!(
                        f,
                        "settlement: {message} (operator balance shortfall - top up the operator wallet)"
                    )
                } else {
                    write!(f, "settlement: {message}")
                }
            }
            OpsError::LockContention(msg) => write!(f, "lock contention: {msg}"),
            OpsError::NotFound(msg) => write!(f, "not found: {msg}"),
            OpsError::Internal(err) => write!(f, "internal: {err}"),
        }
    }
}

impl std::error::Error for OpsError {}

impl From<anyhow::Error> for OpsError {
    fn from(err: anyhow::Error) -> Self {
        OpsError::Internal(err)
    }
}

pub type OpsResult<T> = Result<T, OpsError>;
