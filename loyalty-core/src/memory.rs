//! In-process ledger
//!
//! Implements all three ledger traits over shared maps. A single number index
//! enforces the global order/withdrawal uniqueness, and each user's balance
//! sits behind its own async mutex, standing in for the row lock a database
//! would take. Settlement holds the owner's balance lock while it updates the
//! order, so concurrent settlements of one order serialize.

use crate::ledger::{BalanceLedger, OrderLedger, Settlement, WithdrawalLedger};
use crate::types::{Balance, Order, OrderStatus, TransactionKind, UserId, Withdrawal};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone)]
struct StoredOrder {
    seq: u64,
    order: Order,
}

/// Ledger kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryLedger {
    /// number -> owner, shared by orders and withdrawals
    numbers: DashMap<String, UserId>,
    orders: DashMap<String, StoredOrder>,
    balances: DashMap<UserId, Arc<Mutex<Balance>>>,
    withdrawals: RwLock<Vec<Withdrawal>>,
    sequence: AtomicU64,
    withdrawal_ids: AtomicI64,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn balance_row(&self, owner: UserId) -> Arc<Mutex<Balance>> {
        self.balances
            .entry(owner)
            .or_insert_with(|| Arc::new(Mutex::new(Balance::empty(owner))))
            .value()
            .clone()
    }

    fn claim_number(&self, number: &str, owner: UserId) -> bool {
        match self.numbers.entry(number.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(owner);
                true
            }
        }
    }
}

#[async_trait]
impl OrderLedger for MemoryLedger {
    async fn create(&self, number: &str, owner: UserId) -> Result<Order> {
        if !self.claim_number(number, owner) {
            return Err(Error::DuplicateOrder {
                number: number.to_string(),
            });
        }

        let order = Order {
            number: number.to_string(),
            owner,
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            uploaded_at: Utc::now(),
        };
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.orders.insert(
            number.to_string(),
            StoredOrder {
                seq,
                order: order.clone(),
            },
        );

        Ok(order)
    }

    async fn check_exists(&self, number: &str) -> Result<Option<UserId>> {
        Ok(self.numbers.get(number).map(|owner| *owner))
    }

    async fn get(&self, number: &str) -> Result<Order> {
        self.orders
            .get(number)
            .map(|stored| stored.order.clone())
            .ok_or_else(|| Error::OrderNotFound(number.to_string()))
    }

    async fn list_by_owner(&self, owner: UserId) -> Result<Vec<Order>> {
        let mut stored: Vec<StoredOrder> = self
            .orders
            .iter()
            .filter(|entry| entry.order.owner == owner)
            .map(|entry| entry.value().clone())
            .collect();
        stored.sort_by(|a, b| {
            (b.order.uploaded_at, b.seq).cmp(&(a.order.uploaded_at, a.seq))
        });

        Ok(stored.into_iter().map(|s| s.order).collect())
    }

    async fn update(&self, order: &Order) -> Result<()> {
        let mut stored = self
            .orders
            .get_mut(&order.number)
            .ok_or_else(|| Error::OrderNotFound(order.number.clone()))?;
        stored.order.status = order.status;
        stored.order.accrual = order.accrual;

        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Order>> {
        let mut stored: Vec<StoredOrder> = self
            .orders
            .iter()
            .filter(|entry| !entry.order.status.is_final())
            .map(|entry| entry.value().clone())
            .collect();
        stored.sort_by(|a, b| {
            (a.order.uploaded_at, a.seq).cmp(&(b.order.uploaded_at, b.seq))
        });
        stored.truncate(limit);

        Ok(stored.into_iter().map(|s| s.order).collect())
    }

    async fn settle(&self, number: &str, status: OrderStatus, accrual: Decimal) -> Result<Settlement> {
        let owner = self
            .orders
            .get(number)
            .map(|stored| stored.order.owner)
            .ok_or_else(|| Error::OrderNotFound(number.to_string()))?;

        let row = self.balance_row(owner);
        let mut balance = row.lock().await;

        let mut stored = self
            .orders
            .get_mut(number)
            .ok_or_else(|| Error::OrderNotFound(number.to_string()))?;
        let current = stored.order.status;
        if !current.can_transition_to(status) {
            return Ok(Settlement::Skipped { current });
        }

        let credited = if status == OrderStatus::Processed && accrual > Decimal::ZERO {
            balance.apply(accrual, TransactionKind::Credit)?;
            Some(accrual)
        } else {
            None
        };
        stored.order.status = status;
        stored.order.accrual = accrual;

        Ok(Settlement::Applied {
            order: stored.order.clone(),
            credited,
        })
    }
}

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn get_or_create(&self, owner: UserId) -> Result<Balance> {
        let row = self.balance_row(owner);
        let balance = row.lock().await;
        Ok(balance.clone())
    }

    async fn apply_transaction(&self, owner: UserId, amount: Decimal, kind: TransactionKind) -> Result<Balance> {
        let row = self.balance_row(owner);
        let mut balance = row.lock().await;
        balance.apply(amount, kind)?;
        Ok(balance.clone())
    }
}

#[async_trait]
impl WithdrawalLedger for MemoryLedger {
    async fn create(&self, owner: UserId, order_number: &str, sum: Decimal) -> Result<Withdrawal> {
        if sum <= Decimal::ZERO {
            return Err(Error::InvalidAmount(sum));
        }
        if !self.claim_number(order_number, owner) {
            return Err(Error::OrderNumberReused {
                number: order_number.to_string(),
            });
        }

        let withdrawal = Withdrawal {
            id: self.withdrawal_ids.fetch_add(1, Ordering::SeqCst) + 1,
            owner,
            order_number: order_number.to_string(),
            sum,
            processed_at: Utc::now(),
        };
        self.withdrawals.write().await.push(withdrawal.clone());

        Ok(withdrawal)
    }

    async fn list_by_owner(&self, owner: UserId) -> Result<Vec<Withdrawal>> {
        let withdrawals = self.withdrawals.read().await;
        Ok(withdrawals
            .iter()
            .rev()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_create_and_get_order() {
        let ledger = MemoryLedger::new();

        let order = OrderLedger::create(&ledger, "79927398713", 1).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.accrual, Decimal::ZERO);

        let fetched = ledger.get("79927398713").await.unwrap();
        assert_eq!(fetched, order);
        assert_eq!(ledger.check_exists("79927398713").await.unwrap(), Some(1));
        assert_eq!(ledger.check_exists("12345678903").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_order_rejected() {
        let ledger = MemoryLedger::new();
        OrderLedger::create(&ledger, "79927398713", 1).await.unwrap();

        let err = OrderLedger::create(&ledger, "79927398713", 2).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateOrder { .. }));
        assert_eq!(ledger.get("79927398713").await.unwrap().owner, 1);
    }

    #[tokio::test]
    async fn test_numbers_shared_between_orders_and_withdrawals() {
        let ledger = MemoryLedger::new();
        WithdrawalLedger::create(&ledger, 1, "2377225624", dec!(10)).await.unwrap();

        assert_eq!(ledger.check_exists("2377225624").await.unwrap(), Some(1));
        let err = OrderLedger::create(&ledger, "2377225624", 1).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateOrder { .. }));

        OrderLedger::create(&ledger, "79927398713", 1).await.unwrap();
        let err = WithdrawalLedger::create(&ledger, 1, "79927398713", dec!(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OrderNumberReused { .. }));
    }

    #[tokio::test]
    async fn test_orders_listed_newest_first() {
        let ledger = MemoryLedger::new();
        for number in ["18", "26", "34"] {
            OrderLedger::create(&ledger, number, 7).await.unwrap();
        }
        OrderLedger::create(&ledger, "42", 8).await.unwrap();

        let numbers: Vec<String> = OrderLedger::list_by_owner(&ledger, 7)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.number)
            .collect();
        assert_eq!(numbers, vec!["34", "26", "18"]);
        assert!(OrderLedger::list_by_owner(&ledger, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_pending_skips_final_orders() {
        let ledger = MemoryLedger::new();
        for number in ["18", "26", "34"] {
            OrderLedger::create(&ledger, number, 1).await.unwrap();
        }
        ledger.settle("26", OrderStatus::Invalid, Decimal::ZERO).await.unwrap();
        ledger.settle("34", OrderStatus::Processing, Decimal::ZERO).await.unwrap();

        let pending: Vec<String> = ledger
            .list_pending(10)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.number)
            .collect();
        assert_eq!(pending, vec!["18", "34"]);
        assert_eq!(ledger.list_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_overwrites_status_and_accrual() {
        let ledger = MemoryLedger::new();
        let mut order = OrderLedger::create(&ledger, "18", 1).await.unwrap();
        order.status = OrderStatus::Processing;
        order.accrual = dec!(1.5);
        ledger.update(&order).await.unwrap();

        let stored = ledger.get("18").await.unwrap();
        assert_eq!(stored.status, OrderStatus::Processing);
        assert_eq!(stored.accrual, dec!(1.5));

        order.number = "26".to_string();
        assert!(matches!(ledger.update(&order).await, Err(Error::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_balance_created_lazily() {
        let ledger = MemoryLedger::new();
        let balance = ledger.get_or_create(5).await.unwrap();
        assert_eq!(balance.current, Decimal::ZERO);
        assert_eq!(balance.withdrawn, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_debit_requires_funds() {
        let ledger = MemoryLedger::new();
        ledger
            .apply_transaction(1, dec!(100), TransactionKind::Credit)
            .await
            .unwrap();

        let balance = ledger
            .apply_transaction(1, dec!(40.5), TransactionKind::Debit)
            .await
            .unwrap();
        assert_eq!(balance.current, dec!(59.5));
        assert_eq!(balance.withdrawn, dec!(40.5));

        let err = ledger
            .apply_transaction(1, dec!(60), TransactionKind::Debit)
            .await
            .unwrap_err();
        match err {
            Error::InsufficientFunds { required, available } => {
                assert_eq!(required, dec!(60));
                assert_eq!(available, dec!(59.5));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(ledger.get_or_create(1).await.unwrap().current, dec!(59.5));
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .apply_transaction(1, Decimal::ZERO, TransactionKind::Credit)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_one_wins() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .apply_transaction(1, dec!(100), TransactionKind::Credit)
            .await
            .unwrap();

        let a = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.apply_transaction(1, dec!(80), TransactionKind::Debit).await })
        };
        let b = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.apply_transaction(1, dec!(80), TransactionKind::Debit).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::InsufficientFunds { .. })))
                .count(),
            1
        );

        let balance = ledger.get_or_create(1).await.unwrap();
        assert_eq!(balance.current, dec!(20));
        assert_eq!(balance.withdrawn, dec!(80));
    }

    #[tokio::test]
    async fn test_settle_credits_once() {
        let ledger = MemoryLedger::new();
        OrderLedger::create(&ledger, "18", 3).await.unwrap();
        ledger.settle("18", OrderStatus::Processing, Decimal::ZERO).await.unwrap();

        let first = ledger.settle("18", OrderStatus::Processed, dec!(500)).await.unwrap();
        match first {
            Settlement::Applied { order, credited } => {
                assert_eq!(order.status, OrderStatus::Processed);
                assert_eq!(order.accrual, dec!(500));
                assert_eq!(credited, Some(dec!(500)));
            }
            other => panic!("unexpected settlement: {:?}", other),
        }

        let second = ledger.settle("18", OrderStatus::Processed, dec!(500)).await.unwrap();
        assert_eq!(
            second,
            Settlement::Skipped {
                current: OrderStatus::Processed
            }
        );
        assert_eq!(ledger.get_or_create(3).await.unwrap().current, dec!(500));
    }

    #[tokio::test]
    async fn test_settle_invalid_does_not_credit() {
        let ledger = MemoryLedger::new();
        OrderLedger::create(&ledger, "18", 3).await.unwrap();

        let settlement = ledger.settle("18", OrderStatus::Invalid, Decimal::ZERO).await.unwrap();
        assert!(matches!(settlement, Settlement::Applied { credited: None, .. }));
        assert_eq!(ledger.get_or_create(3).await.unwrap().current, Decimal::ZERO);

        let err = ledger.settle("26", OrderStatus::Invalid, Decimal::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn test_withdrawals_newest_first() {
        let ledger = MemoryLedger::new();
        WithdrawalLedger::create(&ledger, 1, "18", dec!(1)).await.unwrap();
        WithdrawalLedger::create(&ledger, 2, "26", dec!(2)).await.unwrap();
        WithdrawalLedger::create(&ledger, 1, "34", dec!(3)).await.unwrap();

        let mine = WithdrawalLedger::list_by_owner(&ledger, 1).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].order_number, "34");
        assert_eq!(mine[1].order_number, "18");
        assert!(mine[0].id > mine[1].id);
    }
}
