//! Accrual reconciler
//!
//! Background task that polls the accrual oracle for every non-final order
//! and settles the verdicts. Runs on a fixed interval until its cancellation
//! token fires; failures are isolated per order and retried next tick.

use crate::config::ReconcilerConfig;
use crate::ledger::{OrderLedger, Settlement};
use crate::oracle::{AccrualOracle, OracleReply};
use crate::types::Order;
use crate::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters for one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pending orders fetched
    pub examined: usize,
    /// Orders whose status changed
    pub updated: usize,
    /// Orders whose accrual was credited
    pub credited: usize,
    /// Oracle agreed with the stored status
    pub unchanged: usize,
    /// Settlement refused because the stored status moved on
    pub skipped: usize,
    /// Oracle or storage errors, retried next tick
    pub failed: usize,
    /// 429 replies
    pub rate_limited: usize,
}

enum Step {
    Updated { credited: bool },
    Unchanged,
    Skipped,
    RateLimited(Option<Duration>),
    Failed,
}

/// Drives pending orders to a final status
pub struct Reconciler {
    orders: Arc<dyn OrderLedger>,
    oracle: Arc<dyn AccrualOracle>,
    config: ReconcilerConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        orders: Arc<dyn OrderLedger>,
        oracle: Arc<dyn AccrualOracle>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orders,
            oracle,
            config,
        }
    }

    /// Start the loop on the current runtime
    pub fn spawn(self, shutdown: CancellationToken) -> ReconcilerHandle {
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        ReconcilerHandle { shutdown, join }
    }

    /// Tick every `poll_interval` until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Starting accrual reconciler (interval {:?}, batch {})",
            self.config.poll_interval, self.config.batch_size
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(&shutdown).await {
                        Ok(report) if report.examined > 0 => {
                            info!(
                                examined = report.examined,
                                updated = report.updated,
                                credited = report.credited,
                                failed = report.failed,
                                rate_limited = report.rate_limited,
                                "Reconciliation tick complete"
                            );
                        }
                        Ok(_) => debug!("No pending orders"),
                        Err(e) => error!("Failed to load pending orders: {}", e),
                    }
                }
            }
        }

        info!("Accrual reconciler stopped");
    }

    /// One pass over up to `batch_size` pending orders
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<TickReport> {
        let pending = self.orders.list_pending(self.config.batch_size).await?;
        let mut report = TickReport {
            examined: pending.len(),
            ..TickReport::default()
        };

        for order in &pending {
            if shutdown.is_cancelled() {
                break;
            }

            match self.reconcile(order).await {
                Step::Updated { credited } => {
                    report.updated += 1;
                    if credited {
                        report.credited += 1;
                    }
                }
                Step::Unchanged => report.unchanged += 1,
                Step::Skipped => report.skipped += 1,
                Step::Failed => report.failed += 1,
                Step::RateLimited(retry_after) => {
                    report.rate_limited += 1;
                    let delay = match retry_after {
                        Some(requested) => requested.min(self.config.max_retry_after),
                        None => {
                            warn!("Accrual oracle rate limited without Retry-After, continuing");
                            continue;
                        }
                    };
                    warn!("Accrual oracle rate limited, pausing for {:?}", delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Ok(report)
    }

    async fn reconcile(&self, order: &Order) -> Step {
        let reply = match self.oracle.query(&order.number).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(order_number = %order.number, "Accrual query failed: {}", e);
                return Step::Failed;
            }
        };

        let (status, accrual) = match reply.candidate() {
            Some(candidate) => candidate,
            None => {
                let retry_after = match reply {
                    OracleReply::RateLimited { retry_after } => retry_after,
                    _ => None,
                };
                return Step::RateLimited(retry_after);
            }
        };

        if accrual < Decimal::ZERO {
            warn!(order_number = %order.number, "Oracle reported negative accrual {}", accrual);
            return Step::Failed;
        }
        if status == order.status {
            return Step::Unchanged;
        }

        match self.orders.settle(&order.number, status, accrual).await {
            Ok(Settlement::Applied { order: settled, credited }) => {
                match credited {
                    Some(amount) => info!(
                        order_number = %settled.number,
                        user_id = settled.owner,
                        "Order processed, credited {}",
                        amount
                    ),
                    None => debug!(order_number = %settled.number, "Order moved to {}", settled.status),
                }
                Step::Updated {
                    credited: credited.is_some(),
                }
            }
            Ok(Settlement::Skipped { current }) => {
                debug!(
                    order_number = %order.number,
                    "Settlement to {} skipped, order already {}",
                    status,
                    current
                );
                Step::Skipped
            }
            Err(e) => {
                error!(order_number = %order.number, "Settlement failed: {}", e);
                Step::Failed
            }
        }
    }
}

/// Handle to a spawned reconciler
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Token that stops the loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request the loop to stop without waiting
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the loop to exit
    pub async fn join(self) -> std::result::Result<(), JoinError> {
        self.join.await
    }

    /// Stop the loop and wait for it
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join().await {
            error!("Accrual reconciler task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BalanceLedger;
    use crate::oracle::{AccrualVerdict, OracleError, OracleStatus};
    use crate::types::OrderStatus;
    use crate::MemoryLedger;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Scripted = std::result::Result<OracleReply, OracleError>;

    #[derive(Default)]
    struct ScriptedOracle {
        replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn push(&self, number: &str, reply: Scripted) {
            self.replies
                .lock()
                .unwrap()
                .entry(number.to_string())
                .or_default()
                .push_back(reply);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AccrualOracle for ScriptedOracle {
        async fn query(&self, number: &str) -> std::result::Result<OracleReply, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .get_mut(number)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| Err(OracleError::Transport("no scripted reply".to_string())))
        }
    }

    fn verdict(number: &str, status: OracleStatus, accrual: Option<Decimal>) -> Scripted {
        Ok(OracleReply::Verdict(AccrualVerdict {
            order: number.to_string(),
            status,
            accrual,
        }))
    }

    fn setup(config: ReconcilerConfig) -> (Reconciler, Arc<MemoryLedger>, Arc<ScriptedOracle>) {
        let ledger = Arc::new(MemoryLedger::new());
        let oracle = Arc::new(ScriptedOracle::default());
        let reconciler = Reconciler::new(ledger.clone(), oracle.clone(), config);
        (reconciler, ledger, oracle)
    }

    #[tokio::test]
    async fn test_processed_order_credited_once() {
        let (reconciler, ledger, oracle) = setup(ReconcilerConfig::default());
        let token = CancellationToken::new();
        OrderLedger::create(ledger.as_ref(), "18", 3).await.unwrap();
        oracle.push("18", verdict("18", OracleStatus::Processing, None));
        oracle.push("18", verdict("18", OracleStatus::Processed, Some(dec!(500))));

        let first = reconciler.tick(&token).await.unwrap();
        assert_eq!(first.updated, 1);
        assert_eq!(first.credited, 0);
        assert_eq!(ledger.get("18").await.unwrap().status, OrderStatus::Processing);

        let second = reconciler.tick(&token).await.unwrap();
        assert_eq!(second.credited, 1);
        let order = ledger.get("18").await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, dec!(500));

        let third = reconciler.tick(&token).await.unwrap();
        assert_eq!(third, TickReport::default());
        assert_eq!(oracle.calls(), 2);
        assert_eq!(ledger.get_or_create(3).await.unwrap().current, dec!(500));
    }

    #[tokio::test]
    async fn test_unknown_order_becomes_invalid() {
        let (reconciler, ledger, oracle) = setup(ReconcilerConfig::default());
        OrderLedger::create(ledger.as_ref(), "26", 1).await.unwrap();
        oracle.push("26", Ok(OracleReply::Unknown));

        let report = reconciler.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(ledger.get("26").await.unwrap().status, OrderStatus::Invalid);
        assert_eq!(ledger.get_or_create(1).await.unwrap().current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_registered_moves_new_to_processing() {
        let (reconciler, ledger, oracle) = setup(ReconcilerConfig::default());
        OrderLedger::create(ledger.as_ref(), "18", 1).await.unwrap();
        oracle.push("18", verdict("18", OracleStatus::Registered, None));
        oracle.push("18", verdict("18", OracleStatus::Processing, None));

        let token = CancellationToken::new();
        reconciler.tick(&token).await.unwrap();
        assert_eq!(ledger.get("18").await.unwrap().status, OrderStatus::Processing);

        let report = reconciler.tick(&token).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.updated, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pauses_then_continues() {
        let config = ReconcilerConfig::default().with_max_retry_after(Duration::from_secs(5));
        let (reconciler, ledger, oracle) = setup(config);
        OrderLedger::create(ledger.as_ref(), "18", 1).await.unwrap();
        OrderLedger::create(ledger.as_ref(), "26", 1).await.unwrap();
        oracle.push(
            "18",
            Ok(OracleReply::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            }),
        );
        oracle.push("26", verdict("26", OracleStatus::Processed, Some(dec!(10))));

        let started = tokio::time::Instant::now();
        let report = reconciler.tick(&CancellationToken::new()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.rate_limited, 1);
        assert_eq!(report.credited, 1);
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(30));
        assert_eq!(ledger.get("18").await.unwrap().status, OrderStatus::New);
        assert_eq!(ledger.get_or_create(1).await.unwrap().current, dec!(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_retry_after_continues_immediately() {
        let (reconciler, ledger, oracle) = setup(ReconcilerConfig::default());
        OrderLedger::create(ledger.as_ref(), "18", 1).await.unwrap();
        OrderLedger::create(ledger.as_ref(), "26", 1).await.unwrap();
        oracle.push("18", Ok(OracleReply::RateLimited { retry_after: None }));
        oracle.push("26", verdict("26", OracleStatus::Processed, Some(dec!(10))));

        let started = tokio::time::Instant::now();
        let report = reconciler.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(report.rate_limited, 1);
        assert_eq!(report.credited, 1);
        assert_eq!(ledger.get("18").await.unwrap().status, OrderStatus::New);
        assert_eq!(ledger.get("26").await.unwrap().status, OrderStatus::Processed);
        assert_eq!(ledger.get_or_create(1).await.unwrap().current, dec!(10));
    }

    #[tokio::test]
    async fn test_failures_isolated_per_order() {
        let (reconciler, ledger, oracle) = setup(ReconcilerConfig::default());
        for number in ["18", "26", "34"] {
            OrderLedger::create(ledger.as_ref(), number, 1).await.unwrap();
        }
        oracle.push("18", Err(OracleError::UnexpectedStatus(500)));
        oracle.push("26", verdict("26", OracleStatus::Processed, Some(dec!(-1))));
        oracle.push("34", verdict("34", OracleStatus::Processed, Some(dec!(7.25))));

        let report = reconciler.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.credited, 1);
        assert_eq!(ledger.get("18").await.unwrap().status, OrderStatus::New);
        assert_eq!(ledger.get("26").await.unwrap().status, OrderStatus::New);
        assert_eq!(ledger.get_or_create(1).await.unwrap().current, dec!(7.25));
    }

    #[tokio::test]
    async fn test_cancelled_tick_queries_nothing() {
        let (reconciler, ledger, oracle) = setup(ReconcilerConfig::default());
        OrderLedger::create(ledger.as_ref(), "18", 1).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let report = reconciler.tick(&token).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_stops_on_shutdown() {
        let config = ReconcilerConfig::default().with_poll_interval(Duration::from_secs(1));
        let (reconciler, ledger, oracle) = setup(config);
        OrderLedger::create(ledger.as_ref(), "18", 1).await.unwrap();
        oracle.push("18", verdict("18", OracleStatus::Invalid, None));

        let handle = reconciler.spawn(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown().await;

        assert_eq!(ledger.get("18").await.unwrap().status, OrderStatus::Invalid);
        assert_eq!(oracle.calls(), 1);
    }
}
