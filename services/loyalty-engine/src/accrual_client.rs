use crate::metrics::ORACLE_RESPONSES;
use async_trait::async_trait;
use loyalty_core::oracle::parse_retry_after;
use loyalty_core::{AccrualOracle, AccrualVerdict, OracleError, OracleReply};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for the external accrual system
pub struct AccrualClient {
    base_url: String,
    client: Client,
}

impl AccrualClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| OracleError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(AccrualClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn record(outcome: &str) {
        ORACLE_RESPONSES.with_label_values(&[outcome]).inc();
    }
}

#[async_trait]
impl AccrualOracle for AccrualClient {
    async fn query(&self, number: &str) -> Result<OracleReply, OracleError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);

        let response = self.client.get(&url).send().await.map_err(|e| {
            Self::record("transport_error");
            OracleError::Transport(e.to_string())
        })?;

        match response.status() {
            StatusCode::OK => {
                let verdict = response.json::<AccrualVerdict>().await.map_err(|e| {
                    Self::record("decode_error");
                    OracleError::Decode(e.to_string())
                })?;

                if verdict.accrual.is_some_and(|accrual| accrual < Decimal::ZERO) {
                    Self::record("decode_error");
                    return Err(OracleError::Decode(format!(
                        "negative accrual for order {}",
                        verdict.order
                    )));
                }

                debug!(order_number = number, status = ?verdict.status, "Accrual verdict received");
                Self::record("verdict");
                Ok(OracleReply::Verdict(verdict))
            }
            StatusCode::NO_CONTENT => {
                Self::record("unknown");
                Ok(OracleReply::Unknown)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_retry_after);
                Self::record("rate_limited");
                Ok(OracleReply::RateLimited { retry_after })
            }
            status => {
                warn!(order_number = number, "Accrual system returned {}", status);
                Self::record("unexpected_status");
                Err(OracleError::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}
