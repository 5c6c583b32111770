//! Clearing Error Types

use thiserror::Error;

/// Errors surfaced by clearing operations.
#[derive(Debug, Error)]
pub enum ClearingError {
    // Validation
    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    #[error("Invalid account id: {id}")]
    InvalidAccountId { id: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatus { from: String, to: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // Business
    #[error("Insufficient funds on {account_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        account_id: String,
        requested: String,
        available: String,
    },

    #[error("Limit exceeded on {account_id}: {limit}")]
    LimitExceeded { account_id: String, limit: String },

    #[error("Account is not active: {account_id}")]
    AccountInactive { account_id: String },

    #[error("Cannot transfer to self")]
    SelfTransfer,

    #[error("Api key already in use")]
    DuplicateApiKey,

    // Authorization
    #[error("Unauthorized: {action}")]
    Unauthorized { action: String },

    #[error("Forbidden: actor {actor_id} may not perform {action}")]
    Forbidden { actor_id: String, action: String },

    #[error("Rate limited: {actor_id}")]
    RateLimited { actor_id: String },

    // Not found
    #[error("Account not found: {id}")]
    AccountNotFound { id: String },

    #[error("Transaction not found: {id}")]
    TransactionNotFound { id: String },

    #[error("Escrow not found: {id}")]
    EscrowNotFound { id: String },

    #[error("Batch not found: {id}")]
    BatchNotFound { id: String },

    #[error("Scheduled payment not found: {id}")]
    PaymentNotFound { id: String },

    // Concurrency
    #[error("Idempotency conflict on key {key}")]
    IdempotencyConflict { key: String },

    #[error("Lock timeout on {resource}")]
    LockTimeout { resource: String },

    // Infrastructure
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Operation timed out")]
    Timeout,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ClearingError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Errors that indicate the surrounding storage transaction was (or
    /// must be) rolled back, as opposed to failures caught before any
    /// write happened.
    pub fn rolls_back(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Timeout | Self::LockTimeout { .. } | Self::Internal { .. }
        )
    }
}

impl From<sqlx::Error> for ClearingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Self::LockTimeout {
                resource: "connection pool".to_string(),
            },
            other => Self::Storage {
                message: other.to_string(),
            },
        }
    }
}
