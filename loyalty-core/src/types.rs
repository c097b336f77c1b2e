//! Core domain types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric user identity resolved by the authentication layer
pub type UserId = i64;

/// Order lifecycle status
///
/// `NEW -> PROCESSING -> {INVALID, PROCESSED}`; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Uploaded, not yet seen by the oracle
    New,
    /// Oracle is calculating the accrual
    Processing,
    /// Oracle rejected the order; no accrual
    Invalid,
    /// Accrual calculated and credited
    Processed,
}

impl OrderStatus {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    /// Terminal statuses never change again
    pub fn is_final(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::New, OrderStatus::New) => false,
            (OrderStatus::New, _) => true,
            (OrderStatus::Processing, OrderStatus::Invalid | OrderStatus::Processed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Purchase order uploaded by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Luhn-valid order number, unique across orders and withdrawals
    pub number: String,
    /// Owning user
    pub owner: UserId,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Points awarded by the oracle (zero until processed)
    pub accrual: Decimal,
    /// Upload time
    pub uploaded_at: DateTime<Utc>,
}

/// Per-user balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Owning user
    pub owner: UserId,
    /// Spendable points, never negative
    pub current: Decimal,
    /// Total points ever withdrawn
    pub withdrawn: Decimal,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// Zeroed balance for a user seen for the first time
    pub fn empty(owner: UserId) -> Self {
        Self {
            owner,
            current: Decimal::ZERO,
            withdrawn: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Apply one credit or debit in place.
    ///
    /// Fails without touching the balance when `amount` is not positive or a
    /// debit exceeds `current`.
    pub fn apply(&mut self, amount: Decimal, kind: TransactionKind) -> crate::Result<()> {
        if amount <= Decimal::ZERO {
            return Err(crate::Error::InvalidAmount(amount));
        }

        match kind {
            TransactionKind::Credit => {
                self.current += amount;
            }
            TransactionKind::Debit => {
                if self.current < amount {
                    return Err(crate::Error::InsufficientFunds {
                        required: amount,
                        available: self.current,
                    });
                }
                self.current -= amount;
                self.withdrawn += amount;
            }
        }
        self.updated_at = Utc::now();

        Ok(())
    }
}

/// Recorded debit against a balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Generated identifier
    pub id: i64,
    /// Owning user
    pub owner: UserId,
    /// Order number the points were spent on
    pub order_number: String,
    /// Debited amount, strictly positive
    pub sum: Decimal,
    /// Time the withdrawal was recorded
    pub processed_at: DateTime<Utc>,
}

/// Registered user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Generated identifier
    pub id: UserId,
    /// Unique login
    pub login: String,
    /// PHC-formatted password hash
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// Direction of a balance transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Accrual: increases `current`
    Credit,
    /// Withdrawal: moves funds from `current` to `withdrawn`
    Debit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            OrderStatus::New,
            OrderStatus::Processing,
            OrderStatus::Invalid,
            OrderStatus::Processed,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("REGISTERED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;

        assert!(New.can_transition_to(Processing));
        assert!(New.can_transition_to(Processed));
        assert!(New.can_transition_to(Invalid));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Invalid));

        assert!(!Processing.can_transition_to(New));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Processed.can_transition_to(Invalid));
        assert!(!Invalid.can_transition_to(Processed));
        assert!(Processed.is_final() && Invalid.is_final());
        assert!(!New.is_final() && !Processing.is_final());
    }
}
