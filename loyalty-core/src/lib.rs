//! Loyalty Core
//!
//! Order lifecycle and balance settlement engine for a loyalty-points program.
//!
//! # Architecture
//!
//! - **Checksum**: Luhn validation of order numbers before they reach a ledger
//! - **Ledgers**: order, balance and withdrawal storage behind async traits
//! - **Service**: client-facing submission and withdrawal protocols
//! - **Reconciler**: background task applying accrual oracle verdicts
//!
//! # Invariants
//!
//! - `current >= 0` on every balance, under any interleaving of debits
//! - Order and withdrawal numbers share one global uniqueness space
//! - An accrual is credited at most once per order

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod checksum;
pub mod config;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod oracle;
pub mod reconciler;
pub mod service;
pub mod types;

// Re-exports
pub use config::ReconcilerConfig;
pub use error::{Error, Result};
pub use ledger::{BalanceLedger, OrderLedger, Settlement, WithdrawalLedger};
pub use memory::MemoryLedger;
pub use oracle::{AccrualOracle, AccrualVerdict, OracleError, OracleReply, OracleStatus};
pub use reconciler::{Reconciler, ReconcilerHandle, TickReport};
pub use service::{LoyaltyService, SubmitOutcome};
pub use types::{Balance, Order, OrderStatus, TransactionKind, User, UserId, Withdrawal};
