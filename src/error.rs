//! Error types for the transaction manager

use crate::cell::TonCellError;
use thiserror::Error;

/// Main error type for the transaction manager
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue for sender {sender} is full")]
    QueueFull { sender: String },

    #[error("Transaction manager is shutting down")]
    Shutdown,

    #[error("Duplicate request {key} is still in flight")]
    DuplicateRequest { key: String },

    #[error("Unknown sender wallet {0}")]
    UnknownSender(String),

    #[error("Cell error: {0}")]
    Cell(#[from] TonCellError),

    #[error("Node error: {message}")]
    Node { message: String },

    #[error("Node rejected message: {message}")]
    Rejected { message: String },

    #[error("Seqno error for {sender}: {message}")]
    Seqno { sender: String, message: String },

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Fee estimation error: {0}")]
    FeeEstimation(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Rate limited by node {endpoint}")]
    RateLimited { endpoint: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxmError::Node { .. } | TxmError::Timeout { .. } | TxmError::RateLimited { .. }
        )
    }

    /// Errors that mean the external message itself can never be accepted
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TxmError::Cell(_) | TxmError::Keystore(_) | TxmError::Validation(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxmError::Keystore(_)
                | TxmError::InvalidStateTransition { .. }
                | TxmError::Internal(_)
        )
    }
}

impl From<reqwest::Error> for TxmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TxmError::Timeout {
                operation: "node request".to_string(),
            }
        } else {
            TxmError::Node {
                message: e.to_string(),
            }
        }
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TxmError::Node {
            message: "block not ready".into()
        }
        .is_retryable());
        assert!(TxmError::Timeout {
            operation: "send".into()
        }
        .is_retryable());
        assert!(!TxmError::Rejected {
            message: "bad signature".into()
        }
        .is_retryable());
        assert!(TxmError::Keystore("no key".into()).is_structural());
        assert!(!TxmError::Shutdown.is_structural());
    }
}
