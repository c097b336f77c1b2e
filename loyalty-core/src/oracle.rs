//! Accrual oracle contract
//!
//! The oracle decides the final status and accrual of an order. Transport
//! details live in the service crate; this module fixes the replies the
//! reconciler understands.

use crate::types::OrderStatus;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Status as reported by the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OracleStatus {
    /// Order known to the oracle, calculation not started
    Registered,
    /// Calculation in progress
    Processing,
    /// No accrual will be awarded
    Invalid,
    /// Accrual calculated
    Processed,
}

impl From<OracleStatus> for OrderStatus {
    fn from(status: OracleStatus) -> Self {
        match status {
            OracleStatus::Registered | OracleStatus::Processing => OrderStatus::Processing,
            OracleStatus::Invalid => OrderStatus::Invalid,
            OracleStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// Body of a successful oracle response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualVerdict {
    /// Order number echoed back
    pub order: String,
    /// Oracle-side status
    pub status: OracleStatus,
    /// Awarded points, present once processed
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub accrual: Option<Decimal>,
}

/// Reply to a single order query
#[derive(Debug, Clone, PartialEq)]
pub enum OracleReply {
    /// Oracle knows the order
    Verdict(AccrualVerdict),
    /// Oracle has no record of the order
    Unknown,
    /// Too many requests; wait before the next call
    RateLimited {
        /// Parsed `Retry-After`, if the oracle sent a usable one
        retry_after: Option<Duration>,
    },
}

impl OracleReply {
    /// Candidate `(status, accrual)` for the order, `None` when rate limited
    pub fn candidate(&self) -> Option<(OrderStatus, Decimal)> {
        match self {
            OracleReply::Verdict(verdict) => Some((
                verdict.status.into(),
                verdict.accrual.unwrap_or(Decimal::ZERO),
            )),
            OracleReply::Unknown => Some((OrderStatus::Invalid, Decimal::ZERO)),
            OracleReply::RateLimited { .. } => None,
        }
    }
}

/// Transient oracle failures; the order is retried on the next tick
#[derive(Error, Debug)]
pub enum OracleError {
    /// Connection, timeout or other transport failure
    #[error("Oracle transport error: {0}")]
    Transport(String),

    /// Status code outside the protocol
    #[error("Oracle returned unexpected status {0}")]
    UnexpectedStatus(u16),

    /// Body could not be decoded or failed validation
    #[error("Oracle response decode error: {0}")]
    Decode(String),
}

/// Source of accrual verdicts
#[async_trait]
pub trait AccrualOracle: Send + Sync {
    /// Ask the oracle about one order number
    async fn query(&self, number: &str) -> Result<OracleReply, OracleError>;
}

/// Parse a `Retry-After` header given in whole seconds
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_mapping() {
        assert_eq!(OrderStatus::from(OracleStatus::Registered), OrderStatus::Processing);
        assert_eq!(OrderStatus::from(OracleStatus::Processing), OrderStatus::Processing);
        assert_eq!(OrderStatus::from(OracleStatus::Invalid), OrderStatus::Invalid);
        assert_eq!(OrderStatus::from(OracleStatus::Processed), OrderStatus::Processed);
    }

    #[test]
    fn test_candidates() {
        let verdict = OracleReply::Verdict(AccrualVerdict {
            order: "18".to_string(),
            status: OracleStatus::Processed,
            accrual: Some(dec!(729.98)),
        });
        assert_eq!(verdict.candidate(), Some((OrderStatus::Processed, dec!(729.98))));

        let pending = OracleReply::Verdict(AccrualVerdict {
            order: "18".to_string(),
            status: OracleStatus::Registered,
            accrual: None,
        });
        assert_eq!(pending.candidate(), Some((OrderStatus::Processing, Decimal::ZERO)));

        assert_eq!(
            OracleReply::Unknown.candidate(),
            Some((OrderStatus::Invalid, Decimal::ZERO))
        );
        assert_eq!(OracleReply::RateLimited { retry_after: None }.candidate(), None);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("60"), Some(Duration::from_secs(60)));
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after(""), None);
    }
}
