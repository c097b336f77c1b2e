use chrono::{DateTime, Utc};
use loyalty_core::{Balance, Order, OrderStatus, Withdrawal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Register and login request body
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub number: String,
    pub status: OrderStatus,
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        // accrual is only meaningful once the oracle has processed the order
        let accrual = (order.status == OrderStatus::Processed).then_some(order.accrual);
        Self {
            number: order.number,
            status: order.status,
            accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceView {
    #[serde(with = "rust_decimal::serde::float")]
    pub current: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawn: Decimal,
}

impl From<Balance> for BalanceView {
    fn from(balance: Balance) -> Self {
        Self {
            current: balance.current,
            withdrawn: balance.withdrawn,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalView {
    pub order: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<Withdrawal> for WithdrawalView {
    fn from(withdrawal: Withdrawal) -> Self {
        Self {
            order: withdrawal.order_number,
            sum: withdrawal.sum,
            processed_at: withdrawal.processed_at,
        }
    }
}
