use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gateway::GatewayRegistry;
use repository::{OrdersRepository, StaleOrder};
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::{Reconciler, Resolution, ServiceError};

/// Orders looked at per sweep at most.
const SWEEP_BATCH: i64 = 100;

const EXPIRED_NOTE: &str = "payment window expired";

/// Periodically closes gateway orders whose payment never completed.
///
/// The gateway is asked first: a payment it reports is reconciled as such,
/// and only an order the gateway still sees as open is cancelled, which
/// releases its stock and voucher. While the gateway cannot answer, the
/// order is left alone until a later sweep.
pub struct ExpirySweeper {
    orders: Arc<dyn OrdersRepository>,
    gateways: GatewayRegistry,
    reconciler: Reconciler,
    ttl: Duration,
    interval: Duration,
}

pub(crate) fn cutoff(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, ServiceError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| ServiceError::Unexpected(format!("invalid order TTL: {e}")))?;
    Ok(now - ttl)
}

impl ExpirySweeper {
    pub fn new(
        orders: Arc<dyn OrdersRepository>,
        gateways: GatewayRegistry,
        reconciler: Reconciler,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            orders,
            gateways,
            reconciler,
            ttl,
            interval,
        }
    }

    /// Runs until `shutdown` is notified.
    pub async fn run(self, shutdown: Arc<Notify>) {
        info!(ttl = ?self.ttl, interval = ?self.interval, "expiry sweeper started");
        let stop = shutdown.notified();
        tokio::pin!(stop);
        let mut ticker = time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("expiry sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "expiry sweep failed");
                    }
                }
            }
        }
    }

    /// Closes one batch of expired orders and returns how many were closed.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize, ServiceError> {
        let cutoff = cutoff(Utc::now(), self.ttl)?;
        let stale = self.orders.find_stale_pending(cutoff, SWEEP_BATCH).await?;
        let mut closed = 0;
        for order in stale {
            let order_id = order.order_id;
            let Some(resolution) = self.expiry_resolution(&order).await else {
                continue;
            };
            match self.reconciler.apply(order_id, resolution).await {
                Ok(view) => {
                    debug!(%order_id, status = %view.order_status, "expired order closed");
                    closed += 1;
                }
                // A callback settled it between the scan and the lock.
                Err(ServiceError::InvalidTransition { from, .. }) => {
                    debug!(%order_id, %from, "order settled before expiry")
                }
                Err(e) => warn!(%order_id, error = %e, "could not expire order"),
            }
        }
        if closed > 0 {
            info!(closed, "expired orders closed");
        }
        Ok(closed)
    }

    /// What to apply to an expired order, or `None` to retry it next sweep.
    async fn expiry_resolution(&self, order: &StaleOrder) -> Option<Resolution> {
        let Some(gateway) = self.gateways.get(order.method) else {
            return Some(Resolution::cancelled(EXPIRED_NOTE));
        };
        match gateway.query_status(order.order_id).await {
            Ok(Some(outcome)) => {
                info!(order_id = %order.order_id, status = ?outcome.status, "gateway settled an expired order");
                Some(outcome.into())
            }
            Ok(None) => Some(Resolution::cancelled(EXPIRED_NOTE)),
            Err(e) => {
                warn!(order_id = %order.order_id, error = %e, "gateway unavailable, expiry postponed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use cache::StatusCache;
    use chrono::TimeZone;
    use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
    use gateway::{
        GatewayError, GatewayOutcome, GatewayReference, OutcomeStatus, PaymentGateway,
        PaymentIntent,
    };
    use model::PaymentMethod;
    use tokio_postgres::NoTls;
    use uuid::Uuid;

    use crate::{Outcome, Repositories};

    #[test]
    fn test_cutoff_subtracts_ttl() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();
        assert_eq!(cutoff(now, Duration::from_secs(30 * 60)).unwrap(), expected);
    }

    #[test]
    fn test_cutoff_rejects_absurd_ttl() {
        assert!(cutoff(Utc::now(), Duration::MAX).is_err());
    }

    #[derive(Clone, Copy)]
    enum Answer {
        StillOpen,
        Paid,
        Down,
    }

    struct StubGateway(Answer);

    #[async_trait]
    impl PaymentGateway for StubGateway {
        fn method(&self) -> PaymentMethod {
            PaymentMethod::Momo
        }

        async fn create_payment(&self, _: &PaymentIntent) -> Result<GatewayReference, GatewayError> {
            Ok(GatewayReference::default())
        }

        async fn query_status(&self, order_id: Uuid) -> Result<Option<GatewayOutcome>, GatewayError> {
            match self.0 {
                Answer::StillOpen => Ok(None),
                Answer::Paid => Ok(Some(GatewayOutcome {
                    order_id,
                    status: OutcomeStatus::Paid,
                    amount: Some(1_050_000),
                    transaction_ref: Some("4088878653".into()),
                    message: "Successful.".into(),
                })),
                Answer::Down => Err(GatewayError::Rejected {
                    code: "10".into(),
                    message: "maintenance".into(),
                }),
            }
        }

        fn verify_callback(&self, _: &BTreeMap<String, String>) -> Result<GatewayOutcome, GatewayError> {
            Err(GatewayError::InvalidSignature)
        }
    }

    /// A pool that never connects unless a query is made.
    fn idle_pool() -> Pool {
        let config: tokio_postgres::Config = "host=localhost user=checkout dbname=checkout"
            .parse()
            .unwrap();
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(manager).max_size(1).build().unwrap()
    }

    fn sweeper(answer: Answer) -> ExpirySweeper {
        let pool = idle_pool();
        let repos = Repositories::postgres(&pool);
        let reconciler = Reconciler::new(pool, repos.clone(), StatusCache::new(8));
        ExpirySweeper::new(
            repos.orders.clone(),
            GatewayRegistry::new().with(Arc::new(StubGateway(answer))),
            reconciler,
            Duration::from_secs(900),
            Duration::from_secs(60),
        )
    }

    fn stale(method: PaymentMethod) -> StaleOrder {
        StaleOrder {
            order_id: Uuid::new_v4(),
            method,
        }
    }

    #[tokio::test]
    async fn test_open_gateway_payment_is_cancelled() {
        let resolution = sweeper(Answer::StillOpen)
            .expiry_resolution(&stale(PaymentMethod::Momo))
            .await
            .unwrap();
        assert_eq!(resolution.outcome, Outcome::Cancelled);
        assert_eq!(resolution.note.as_deref(), Some(EXPIRED_NOTE));
    }

    #[tokio::test]
    async fn test_payment_found_at_expiry_is_kept() {
        let resolution = sweeper(Answer::Paid)
            .expiry_resolution(&stale(PaymentMethod::Momo))
            .await
            .unwrap();
        assert_eq!(resolution.outcome, Outcome::Paid);
        assert_eq!(resolution.amount, Some(1_050_000));
        assert!(resolution.from_gateway);
    }

    #[tokio::test]
    async fn test_expiry_waits_while_gateway_is_down() {
        let resolution = sweeper(Answer::Down)
            .expiry_resolution(&stale(PaymentMethod::Momo))
            .await;
        assert_eq!(resolution, None);
    }

    #[tokio::test]
    async fn test_method_without_gateway_is_cancelled() {
        let resolution = sweeper(Answer::Down)
            .expiry_resolution(&stale(PaymentMethod::Vnpay))
            .await
            .unwrap();
        assert_eq!(resolution.outcome, Outcome::Cancelled);
    }
}
