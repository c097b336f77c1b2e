//! Client-facing order and withdrawal protocols
//!
//! All operations take an already authenticated [`UserId`].

use crate::checksum;
use crate::ledger::{BalanceLedger, OrderLedger, WithdrawalLedger};
use crate::types::{Balance, Order, TransactionKind, UserId, Withdrawal};
use crate::{Error, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

/// Result of submitting an order number
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// New order stored with status `NEW`
    Accepted(Order),
    /// The caller had already uploaded this number; nothing written
    AlreadyUploaded,
}

/// Order submission, balance and withdrawal operations
pub struct LoyaltyService {
    orders: Arc<dyn OrderLedger>,
    balances: Arc<dyn BalanceLedger>,
    withdrawals: Arc<dyn WithdrawalLedger>,
}

impl std::fmt::Debug for LoyaltyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoyaltyService").finish_non_exhaustive()
    }
}

impl LoyaltyService {
    /// Create service over separate ledgers
    pub fn new(
        orders: Arc<dyn OrderLedger>,
        balances: Arc<dyn BalanceLedger>,
        withdrawals: Arc<dyn WithdrawalLedger>,
    ) -> Self {
        Self {
            orders,
            balances,
            withdrawals,
        }
    }

    /// Create service over one backend implementing all three ledgers
    pub fn with_ledger<L>(ledger: Arc<L>) -> Self
    where
        L: OrderLedger + BalanceLedger + WithdrawalLedger + 'static,
    {
        Self::new(ledger.clone(), ledger.clone(), ledger)
    }

    /// Upload an order number for accrual
    pub async fn submit_order(&self, owner: UserId, number: &str) -> Result<SubmitOutcome> {
        validate_number(number)?;

        if let Some(existing) = self.orders.check_exists(number).await? {
            return ownership_outcome(number, owner, existing);
        }

        match self.orders.create(number, owner).await {
            Ok(order) => {
                info!("Order {} uploaded by user {}", number, owner);
                Ok(SubmitOutcome::Accepted(order))
            }
            Err(Error::DuplicateOrder { .. }) => {
                // lost an insert race; report against whoever won it
                match self.orders.check_exists(number).await? {
                    Some(existing) => ownership_outcome(number, owner, existing),
                    None => Err(Error::DuplicateOrder {
                        number: number.to_string(),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Orders of a user, most recent first
    pub async fn list_orders(&self, owner: UserId) -> Result<Vec<Order>> {
        self.orders.list_by_owner(owner).await
    }

    /// Current balance of a user
    pub async fn balance(&self, owner: UserId) -> Result<Balance> {
        self.balances.get_or_create(owner).await
    }

    /// Spend `sum` points against a fresh order number
    pub async fn withdraw(&self, owner: UserId, number: &str, sum: Decimal) -> Result<Withdrawal> {
        if sum <= Decimal::ZERO {
            return Err(Error::InvalidAmount(sum));
        }
        validate_number(number)?;

        if self.orders.check_exists(number).await?.is_some() {
            return Err(Error::OrderNumberReused {
                number: number.to_string(),
            });
        }

        self.balances
            .apply_transaction(owner, sum, TransactionKind::Debit)
            .await?;

        match self.withdrawals.create(owner, number, sum).await {
            Ok(withdrawal) => {
                info!("User {} withdrew {} against order {}", owner, sum, number);
                Ok(withdrawal)
            }
            Err(e) => {
                error!(
                    user_id = owner,
                    order_number = number,
                    sum = %sum,
                    "Balance debited but withdrawal not recorded: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Withdrawals of a user, newest first
    pub async fn list_withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>> {
        self.withdrawals.list_by_owner(owner).await
    }
}

fn validate_number(number: &str) -> Result<()> {
    checksum::verify(number).map_err(|reason| Error::InvalidOrderNumber {
        number: number.to_string(),
        reason,
    })
}

fn ownership_outcome(number: &str, caller: UserId, existing: UserId) -> Result<SubmitOutcome> {
    if existing == caller {
        Ok(SubmitOutcome::AlreadyUploaded)
    } else {
        Err(Error::OrderOwnedByAnotherUser {
            number: number.to_string(),
            owner: existing,
        })
    }
}
