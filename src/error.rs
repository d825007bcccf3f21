//! Error types for txguard

use ethers::types::H256;
use thiserror::Error;

/// Main error type for nonce reservation, signing and submission
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transient RPC failure on chain {chain_id}: {message}")]
    TransientRpc { chain_id: u64, message: String },

    #[error("Timed out waiting for lock {lock} ({operation})")]
    LockTimeout { lock: String, operation: String },

    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transaction rejected by node: {0}")]
    Rejected(String),

    #[error("Nonce too low: {0}")]
    NonceTooLow(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Transaction already known to node")]
    AlreadyKnown,

    #[error("Transaction {tx_hash:?} reverted: {}", reason.as_deref().unwrap_or("no reason"))]
    Reverted {
        tx_hash: Option<H256>,
        reason: Option<String>,
    },

    #[error("Fee already at cap ({cap} wei), cannot bump further")]
    GasCapReached { cap: String },

    #[error("Request {request_id} is closed with status {status}")]
    IntentClosed { request_id: String, status: String },

    #[error("Request {request_id} is recorded as {recorded:?}, not {sent:?}")]
    HashConflict {
        request_id: String,
        recorded: H256,
        sent: H256,
    },

    #[error("Request {request_id} not found")]
    IntentNotFound { request_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmitError::TransientRpc { .. }
                | SubmitError::LockTimeout { .. }
                | SubmitError::StoreUnavailable(_)
                | SubmitError::Timeout { .. }
        )
    }

    /// Errors that mean the coordination store itself is unhealthy
    pub fn is_store_failure(&self) -> bool {
        matches!(self, SubmitError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for SubmitError {
    fn from(err: redis::RedisError) -> Self {
        SubmitError::StoreUnavailable(err.to_string())
    }
}

/// Result type for txguard operations
pub type SubmitResult<T> = Result<T, SubmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SubmitError::TransientRpc {
            chain_id: 1,
            message: "rate limited".into()
        }
        .is_retryable());
        assert!(SubmitError::LockTimeout {
            lock: "nonce".into(),
            operation: "acquire".into()
        }
        .is_retryable());
        assert!(!SubmitError::Reverted {
            tx_hash: None,
            reason: None
        }
        .is_retryable());
        assert!(!SubmitError::Config("missing key".into()).is_retryable());
    }

    #[test]
    fn test_only_store_errors_are_store_failures() {
        assert!(SubmitError::StoreUnavailable("ping".into()).is_store_failure());
        assert!(!SubmitError::LockTimeout {
            lock: "nonce".into(),
            operation: "acquire".into()
        }
        .is_store_failure());
    }
}
