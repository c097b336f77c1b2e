use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref ORDERS_SUBMITTED: IntCounterVec = register_int_counter_vec!(
        "loyalty_orders_submitted_total",
        "Order submissions by outcome",
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref WITHDRAWALS: IntCounterVec = register_int_counter_vec!(
        "loyalty_withdrawals_total",
        "Withdrawal attempts by outcome",
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref ORACLE_RESPONSES: IntCounterVec = register_int_counter_vec!(
        "loyalty_oracle_responses_total",
        "Accrual oracle responses by outcome",
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref SESSIONS_ISSUED: IntCounterVec = register_int_counter_vec!(
        "loyalty_sessions_issued_total",
        "Session tokens issued by kind",
        &["kind"]
    )
    .expect("metric can be created");
}

/// Generate metrics output in Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
