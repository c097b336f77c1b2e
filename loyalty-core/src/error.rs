//! Error types for the loyalty ledgers

use crate::checksum::ChecksumError;
use crate::types::UserId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Order number failed format or checksum validation
    #[error("Invalid order number {number:?}: {reason}")]
    InvalidOrderNumber {
        /// Number as supplied by the caller
        number: String,
        /// What was wrong with it
        reason: ChecksumError,
    },

    /// Order number already uploaded by a different user
    #[error("Order {number} already uploaded by user {owner}")]
    OrderOwnedByAnotherUser {
        /// Order number
        number: String,
        /// User that owns the number
        owner: UserId,
    },

    /// Storage rejected an insert because the number is taken
    #[error("Order {number} already exists")]
    DuplicateOrder {
        /// Order number
        number: String,
    },

    /// Withdrawal against a number already used by an order or withdrawal
    #[error("Order number {number} has already been used")]
    OrderNumberReused {
        /// Order number
        number: String,
    },

    /// Debit larger than the current balance
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Requested debit
        required: Decimal,
        /// Balance at the time of the check
        available: Decimal,
    },

    /// Non-positive amount passed to a balance operation
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Order not found
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Storage backend failure (connection, transaction, decode)
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Wrap a storage failure with the operation that caused it
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Storage(format!("{}: {}", context, err))
    }
}
