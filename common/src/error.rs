//! Error types for ledger operations.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{AccountNumber, AccountSide, AmountError, Reference, ReferenceError, TransactionId, UserId};

/// Main error type for wallet operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WalletError {
    /// Account number does not resolve.
    #[error("Account not found ({side}): {account_number}")]
    AccountNotFound {
        account_number: AccountNumber,
        side: AccountSide,
    },

    /// Account exists but is not active.
    #[error("Account inactive: {0}")]
    AccountInactive(AccountNumber),

    /// Amount is not positive or too precise.
    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    /// Balance would go negative.
    #[error("Insufficient funds in {account_number}: required {required}, available {available}")]
    InsufficientFunds {
        account_number: AccountNumber,
        required: Decimal,
        available: Decimal,
    },

    /// Sender and receiver are the same account.
    #[error("Cannot transfer from account {0} to itself")]
    SameAccountTransfer(AccountNumber),

    /// Reference already used by a different transaction.
    #[error("Duplicate reference: {0}")]
    DuplicateReference(Reference),

    /// Malformed request field.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        field: Option<String>,
    },

    /// Transaction lookup found nothing.
    #[error("Transaction not found: {0}")]
    NotFound(String),

    /// User lookup found nothing.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Record status change not allowed.
    #[error("Invalid transition for transaction {transaction_id} from {from} to {to}")]
    InvalidTransition {
        transaction_id: TransactionId,
        from: String,
        to: String,
    },

    /// Lock contention, serialization failure or deadlock detected by the
    /// store. Retried by the engine, never surfaced after retries run out.
    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    /// Storage backend cannot serve the request.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Deadline exceeded or caller canceled.
    #[error("Operation canceled: {0}")]
    Canceled(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Broken internal invariant.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Invalid request on a named field.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        WalletError::InvalidRequest {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    /// Check if the caller may retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::StorageConflict(_)
                | WalletError::StorageUnavailable(_)
                | WalletError::Canceled(_)
        )
    }

    /// Errors the engine retries internally before giving up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WalletError::StorageConflict(_) | WalletError::StorageUnavailable(_)
        )
    }

    /// Stable error code for external reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            WalletError::AccountNotFound { .. } => "ACCOUNT_NOT_FOUND",
            WalletError::AccountInactive(_) => "ACCOUNT_INACTIVE",
            WalletError::InvalidAmount(_) => "INVALID_AMOUNT",
            WalletError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            WalletError::SameAccountTransfer(_) => "SAME_ACCOUNT_TRANSFER",
            WalletError::DuplicateReference(_) => "DUPLICATE_REFERENCE",
            WalletError::InvalidRequest { .. } => "INVALID_REQUEST",
            WalletError::NotFound(_) => "NOT_FOUND",
            WalletError::UserNotFound(_) => "USER_NOT_FOUND",
            WalletError::InvalidTransition { .. } => "INVALID_TRANSITION",
            WalletError::StorageConflict(_) => "STORAGE_CONFLICT",
            WalletError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            WalletError::Canceled(_) => "CANCELED",
            WalletError::Configuration(_) => "CONFIGURATION_ERROR",
            WalletError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP-style status an outer layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            WalletError::AccountNotFound { .. }
            | WalletError::NotFound(_)
            | WalletError::UserNotFound(_) => 404,
            WalletError::InvalidAmount(_)
            | WalletError::SameAccountTransfer(_)
            | WalletError::InvalidRequest { .. } => 400,
            WalletError::AccountInactive(_) | WalletError::InsufficientFunds { .. } => 422,
            WalletError::DuplicateReference(_)
            | WalletError::InvalidTransition { .. }
            | WalletError::StorageConflict(_) => 409,
            WalletError::StorageUnavailable(_) => 503,
            WalletError::Canceled(_) => 504,
            WalletError::Configuration(_) | WalletError::Internal(_) => 500,
        }
    }
}

impl From<ReferenceError> for WalletError {
    fn from(e: ReferenceError) -> Self {
        WalletError::invalid_field("reference", e.to_string())
    }
}

/// Result type alias for wallet operations.
pub type Result<T> = std::result::Result<T, WalletError>;
