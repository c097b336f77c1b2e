//! Ledger contracts
//!
//! Storage backends implement these traits; [`crate::MemoryLedger`] is the
//! in-process implementation and the service crate provides the Postgres one.
//! Every method is a single atomic unit against the backing store.

use crate::types::{Balance, Order, OrderStatus, TransactionKind, UserId, Withdrawal};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Outcome of applying an oracle verdict to an order
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Status/accrual written; `credited` is the amount added to the owner's balance
    Applied {
        /// Order after the update
        order: Order,
        /// Credit applied in the same transaction, if any
        credited: Option<Decimal>,
    },
    /// Stored status does not allow the transition (already final, or a regression)
    Skipped {
        /// Status found under the lock
        current: OrderStatus,
    },
}

/// Purchase orders keyed by globally unique number
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Insert a `NEW` order; [`crate::Error::DuplicateOrder`] if the number is taken
    async fn create(&self, number: &str, owner: UserId) -> Result<Order>;

    /// Owner of `number` if any order or withdrawal already uses it
    async fn check_exists(&self, number: &str) -> Result<Option<UserId>>;

    /// Fetch one order
    async fn get(&self, number: &str) -> Result<Order>;

    /// Orders of one user, most recent upload first
    async fn list_by_owner(&self, owner: UserId) -> Result<Vec<Order>>;

    /// Overwrite status and accrual of an existing order
    async fn update(&self, order: &Order) -> Result<()>;

    /// Up to `limit` orders still waiting on the oracle, oldest first
    async fn list_pending(&self, limit: usize) -> Result<Vec<Order>>;

    /// Apply an oracle verdict and the resulting credit in one transaction.
    ///
    /// The order row is locked first; a terminal or otherwise disallowed
    /// transition returns [`Settlement::Skipped`] without side effects, which
    /// makes repeated settlement of the same verdict a no-op.
    async fn settle(&self, number: &str, status: OrderStatus, accrual: Decimal) -> Result<Settlement>;
}

/// Per-user balances
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Current balance, creating a zeroed row on first access
    async fn get_or_create(&self, owner: UserId) -> Result<Balance>;

    /// Credit or debit under the owner's row lock.
    ///
    /// A debit larger than `current` fails with
    /// [`crate::Error::InsufficientFunds`] and leaves the balance untouched.
    async fn apply_transaction(&self, owner: UserId, amount: Decimal, kind: TransactionKind) -> Result<Balance>;
}

/// Append-only withdrawal log
#[async_trait]
pub trait WithdrawalLedger: Send + Sync {
    /// Record a withdrawal; [`crate::Error::OrderNumberReused`] if the number is taken
    async fn create(&self, owner: UserId, order_number: &str, sum: Decimal) -> Result<Withdrawal>;

    /// Withdrawals of one user, newest first
    async fn list_by_owner(&self, owner: UserId) -> Result<Vec<Withdrawal>>;
}
