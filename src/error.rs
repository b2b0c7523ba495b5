//! Error types for the swap coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited on chain {chain}")]
    RateLimited { chain: String },

    #[error("Chain {chain} not found")]
    ChainNotFound { chain: String },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("Invalid secret length: expected 32 bytes, got {0}")]
    InvalidSecretLength(usize),

    #[error("Secret does not match hash lock")]
    HashMismatch,

    #[error("HTLC on chain {chain} expired at {time_lock}")]
    Expired { chain: String, time_lock: u64 },

    #[error("HTLC on chain {chain} does not expire until {time_lock}")]
    NotYetExpired { chain: String, time_lock: u64 },

    #[error("HTLC already redeemed")]
    AlreadyRedeemed,

    #[error("HTLC already refunded")]
    AlreadyRefunded,

    #[error("HTLC {contract_id} not found on chain {chain}")]
    ContractNotFound { chain: String, contract_id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid address for chain {chain}: {address}")]
    InvalidAddress { chain: String, address: String },

    #[error("Unsupported pair {from} -> {to}")]
    UnsupportedPair { from: String, to: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Insufficient balance on chain {chain}: have {have}, need {need}")]
    InsufficientBalance {
        chain: String,
        have: String,
        need: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the monitor reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff, order phase unchanged
    Transient,
    /// Fatal for the leg, never retried
    ProtocolViolation,
    /// Rejected before an order exists
    Validation,
    /// Anything the monitor cannot classify
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::ProtocolViolation => "protocol_violation",
            ErrorClass::Validation => "validation",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl SwapError {
    /// Classify the error for retry and propagation decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            SwapError::ChainConnection { .. }
            | SwapError::Timeout { .. }
            | SwapError::RateLimited { .. }
            | SwapError::Database(_) => ErrorClass::Transient,

            SwapError::HashMismatch
            | SwapError::Expired { .. }
            | SwapError::NotYetExpired { .. }
            | SwapError::AlreadyRedeemed
            | SwapError::AlreadyRefunded => ErrorClass::ProtocolViolation,

            SwapError::Validation(_)
            | SwapError::InvalidAddress { .. }
            | SwapError::UnsupportedPair { .. }
            | SwapError::InvalidSecretLength(_)
            | SwapError::ChainNotFound { .. } => ErrorClass::Validation,

            _ => ErrorClass::Fatal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if error breaks the HTLC protocol for a leg
    pub fn is_protocol_violation(&self) -> bool {
        self.class() == ErrorClass::ProtocolViolation
    }

    /// Shorthand for transport failures talking to a node
    pub fn connection(chain: &str, message: impl ToString) -> Self {
        SwapError::ChainConnection {
            chain: chain.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result type for coordinator operations
pub type SwapResult<T> = Result<T, SwapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(SwapError::connection("ethereum", "connection reset").is_retryable());
        assert!(SwapError::Timeout {
            operation: "get_status".into()
        }
        .is_retryable());
        assert!(SwapError::RateLimited {
            chain: "tron".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_protocol_violations_are_not_retried() {
        let errors = [
            SwapError::HashMismatch,
            SwapError::Expired {
                chain: "bitcoin".into(),
                time_lock: 10,
            },
            SwapError::NotYetExpired {
                chain: "bitcoin".into(),
                time_lock: 10,
            },
            SwapError::AlreadyRedeemed,
        ];
        for err in errors {
            assert!(err.is_protocol_violation(), "{err}");
            assert!(!err.is_retryable(), "{err}");
        }
    }

    #[test]
    fn test_unknown_errors_are_fatal() {
        assert_eq!(
            SwapError::Contract("execution reverted".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SwapError::Validation("amount must be positive".into()).class(),
            ErrorClass::Validation
        );
    }
}
