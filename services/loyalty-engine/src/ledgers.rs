//! Postgres implementations of the ledger traits
//!
//! Every balance mutation runs as begin, lock row, read, validate, write,
//! commit. Number uniqueness across orders and withdrawals is enforced by the
//! `order_numbers` table, claimed in the same transaction as the insert.

use crate::database::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loyalty_core::{
    Balance, BalanceLedger, Error, Order, OrderLedger, OrderStatus, Result, Settlement,
    TransactionKind, UserId, Withdrawal, WithdrawalLedger,
};
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use tracing::debug;

#[derive(sqlx::FromRow)]
struct OrderRow {
    number: String,
    user_id: i64,
    status: String,
    accrual: Decimal,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        let status = row
            .status
            .parse::<OrderStatus>()
            .map_err(|e| Error::storage("decode order status", e))?;
        Ok(Order {
            number: row.number,
            owner: row.user_id,
            status,
            accrual: row.accrual,
            uploaded_at: row.uploaded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BalanceRow {
    user_id: i64,
    current: Decimal,
    withdrawn: Decimal,
    updated_at: DateTime<Utc>,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            owner: row.user_id,
            current: row.current,
            withdrawn: row.withdrawn,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: i64,
    user_id: i64,
    order_number: String,
    sum: Decimal,
    processed_at: DateTime<Utc>,
}

impl From<WithdrawalRow> for Withdrawal {
    fn from(row: WithdrawalRow) -> Self {
        Withdrawal {
            id: row.id,
            owner: row.user_id,
            order_number: row.order_number,
            sum: row.sum,
            processed_at: row.processed_at,
        }
    }
}

fn decode_orders(rows: Vec<OrderRow>) -> Result<Vec<Order>> {
    rows.into_iter().map(Order::try_from).collect()
}

/// Claim `number` for `owner`; false if any order or withdrawal already holds it
async fn claim_number(tx: &mut Transaction<'_, Postgres>, number: &str, owner: UserId) -> Result<bool> {
    let claimed = sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO order_numbers (number, user_id)
        VALUES ($1, $2)
        ON CONFLICT (number) DO NOTHING
        RETURNING number
        "#,
    )
    .bind(number)
    .bind(owner)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| Error::storage("claim order number", e))?;

    Ok(claimed.is_some())
}

/// Lock the owner's balance row, creating it first if needed
async fn lock_balance(tx: &mut Transaction<'_, Postgres>, owner: UserId) -> Result<Balance> {
    sqlx::query(
        r#"
        INSERT INTO balances (user_id, current, withdrawn, updated_at)
        VALUES ($1, 0, 0, $2)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(owner)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::storage("create balance", e))?;

    let row = sqlx::query_as::<_, BalanceRow>(
        r#"
        SELECT user_id, current, withdrawn, updated_at
        FROM balances
        WHERE user_id = $1
        FOR UPDATE
        "#,
    )
    .bind(owner)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| Error::storage("lock balance", e))?;

    Ok(row.into())
}

async fn store_balance(tx: &mut Transaction<'_, Postgres>, balance: &Balance) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE balances
        SET current = $2, withdrawn = $3, updated_at = $4
        WHERE user_id = $1
        "#,
    )
    .bind(balance.owner)
    .bind(balance.current)
    .bind(balance.withdrawn)
    .bind(balance.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::storage("update balance", e))?;

    Ok(())
}

#[async_trait]
impl OrderLedger for Database {
    async fn create(&self, number: &str, owner: UserId) -> Result<Order> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::storage("begin transaction", e))?;

        if !claim_number(&mut tx, number, owner).await? {
            tx.rollback()
                .await
                .map_err(|e| Error::storage("rollback", e))?;
            return Err(Error::DuplicateOrder {
                number: number.to_string(),
            });
        }

        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            INSERT INTO orders (number, user_id, status, accrual, uploaded_at)
            VALUES ($1, $2, $3, 0, $4)
            RETURNING number, user_id, status, accrual, uploaded_at
            "#,
        )
        .bind(number)
        .bind(owner)
        .bind(OrderStatus::New.as_str())
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::storage("insert order", e))?;

        tx.commit()
            .await
            .map_err(|e| Error::storage("commit order", e))?;

        Order::try_from(row)
    }

    async fn check_exists(&self, number: &str) -> Result<Option<UserId>> {
        sqlx::query_scalar::<_, i64>("SELECT user_id FROM order_numbers WHERE number = $1")
            .bind(number)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| Error::storage("check order number", e))
    }

    async fn get(&self, number: &str) -> Result<Order> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE number = $1
            "#,
        )
        .bind(number)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::storage("get order", e))?
        .ok_or_else(|| Error::OrderNotFound(number.to_string()))?;

        Order::try_from(row)
    }

    async fn list_by_owner(&self, owner: UserId) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE user_id = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(owner)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::storage("list orders", e))?;

        decode_orders(rows)
    }

    async fn update(&self, order: &Order) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = $2, accrual = $3 WHERE number = $1")
            .bind(&order.number)
            .bind(order.status.as_str())
            .bind(order.accrual)
            .execute(self.pool())
            .await
            .map_err(|e| Error::storage("update order", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::OrderNotFound(order.number.clone()));
        }
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Order>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::storage("list pending orders", e))?;

        decode_orders(rows)
    }

    async fn settle(&self, number: &str, status: OrderStatus, accrual: Decimal) -> Result<Settlement> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::storage("begin transaction", e))?;

        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE number = $1
            FOR UPDATE
            "#,
        )
        .bind(number)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::storage("lock order", e))?
        .ok_or_else(|| Error::OrderNotFound(number.to_string()))?;
        let mut order = Order::try_from(row)?;

        if !order.status.can_transition_to(status) {
            let current = order.status;
            tx.rollback()
                .await
                .map_err(|e| Error::storage("rollback", e))?;
            debug!(order_number = number, "Settlement skipped, order already {}", current);
            return Ok(Settlement::Skipped { current });
        }

        sqlx::query("UPDATE orders SET status = $2, accrual = $3 WHERE number = $1")
            .bind(number)
            .bind(status.as_str())
            .bind(accrual)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::storage("settle order", e))?;
        order.status = status;
        order.accrual = accrual;

        let credited = if status == OrderStatus::Processed && accrual > Decimal::ZERO {
            let mut balance = lock_balance(&mut tx, order.owner).await?;
            balance.apply(accrual, TransactionKind::Credit)?;
            store_balance(&mut tx, &balance).await?;
            Some(accrual)
        } else {
            None
        };

        tx.commit()
            .await
            .map_err(|e| Error::storage("commit settlement", e))?;

        Ok(Settlement::Applied { order, credited })
    }
}

#[async_trait]
impl BalanceLedger for Database {
    async fn get_or_create(&self, owner: UserId) -> Result<Balance> {
        sqlx::query(
            r#"
            INSERT INTO balances (user_id, current, withdrawn, updated_at)
            VALUES ($1, 0, 0, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(owner)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| Error::storage("create balance", e))?;

        let row = sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, current, withdrawn, updated_at FROM balances WHERE user_id = $1",
        )
        .bind(owner)
        .fetch_one(self.pool())
        .await
        .map_err(|e| Error::storage("get balance", e))?;

        Ok(row.into())
    }

    async fn apply_transaction(&self, owner: UserId, amount: Decimal, kind: TransactionKind) -> Result<Balance> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::storage("begin transaction", e))?;

        let mut balance = lock_balance(&mut tx, owner).await?;
        if let Err(e) = balance.apply(amount, kind) {
            tx.rollback()
                .await
                .map_err(|e| Error::storage("rollback", e))?;
            return Err(e);
        }
        store_balance(&mut tx, &balance).await?;

        tx.commit()
            .await
            .map_err(|e| Error::storage("commit balance", e))?;

        Ok(balance)
    }
}

#[async_trait]
impl WithdrawalLedger for Database {
    async fn create(&self, owner: UserId, order_number: &str, sum: Decimal) -> Result<Withdrawal> {
        if sum <= Decimal::ZERO {
            return Err(Error::InvalidAmount(sum));
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::storage("begin transaction", e))?;

        if !claim_number(&mut tx, order_number, owner).await? {
            tx.rollback()
                .await
                .map_err(|e| Error::storage("rollback", e))?;
            return Err(Error::OrderNumberReused {
                number: order_number.to_string(),
            });
        }

        let row = sqlx::query_as::<_, WithdrawalRow>(
            r#"
            INSERT INTO withdrawals (user_id, order_number, sum, processed_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, order_number, sum, processed_at
            "#,
        )
        .bind(owner)
        .bind(order_number)
        .bind(sum)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::storage("insert withdrawal", e))?;

        tx.commit()
            .await
            .map_err(|e| Error::storage("commit withdrawal", e))?;

        Ok(row.into())
    }

    async fn list_by_owner(&self, owner: UserId) -> Result<Vec<Withdrawal>> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            r#"
            SELECT id, user_id, order_number, sum, processed_at
            FROM withdrawals
            WHERE user_id = $1
            ORDER BY processed_at DESC, id DESC
            "#,
        )
        .bind(owner)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::storage("list withdrawals", e))?;

        Ok(rows.into_iter().map(Withdrawal::from).collect())
    }
}
