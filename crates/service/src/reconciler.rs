//! Moves an order and its payment to a final state.
//!
//! Gateway callbacks, status polls, customer cancellations, admin overrides and
//! the expiry sweeper all end up in [`Reconciler::apply`]. The order row is
//! locked for the duration of the transaction, so concurrent resolutions of the
//! same order are serialised and only the first one wins.

use cache::StatusCache;
use chrono::Utc;
use deadpool_postgres::Pool;
use gateway::{GatewayOutcome, OutcomeStatus};
use model::{Order, OrderStatus, PaymentStatus, PaymentStatusView};
use repository::Settlement;
use tokio_postgres::Transaction;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{Repositories, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Paid,
    Failed,
    Cancelled,
}

impl Outcome {
    pub fn order_status(self) -> OrderStatus {
        match self {
            Outcome::Paid => OrderStatus::Paid,
            Outcome::Failed => OrderStatus::Failed,
            Outcome::Cancelled => OrderStatus::Cancelled,
        }
    }

    /// A cancelled order never collected money, so its payment is failed.
    pub fn payment_status(self) -> PaymentStatus {
        match self {
            Outcome::Paid => PaymentStatus::Paid,
            Outcome::Failed | Outcome::Cancelled => PaymentStatus::Failed,
        }
    }

    fn releases_reservations(self) -> bool {
        !matches!(self, Outcome::Paid)
    }
}

/// Final state to apply to an order, with whatever evidence came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    /// Amount reported by the gateway, checked against the order total.
    pub amount: Option<i64>,
    pub reference: Option<String>,
    pub note: Option<String>,
    /// Reported by a payment gateway rather than decided locally.
    pub from_gateway: bool,
}

impl Resolution {
    pub fn paid(amount: Option<i64>, reference: Option<String>) -> Self {
        Self {
            outcome: Outcome::Paid,
            amount,
            reference,
            note: None,
            from_gateway: false,
        }
    }

    pub fn failed(note: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            amount: None,
            reference: None,
            note: Some(note.into()),
            from_gateway: false,
        }
    }

    pub fn cancelled(note: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Cancelled,
            amount: None,
            reference: None,
            note: Some(note.into()),
            from_gateway: false,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl From<GatewayOutcome> for Resolution {
    fn from(outcome: GatewayOutcome) -> Self {
        let outcome_kind = match outcome.status {
            OutcomeStatus::Paid => Outcome::Paid,
            OutcomeStatus::Failed => Outcome::Failed,
        };
        Resolution {
            outcome: outcome_kind,
            amount: outcome.amount,
            reference: outcome.transaction_ref,
            note: Some(outcome.message),
            from_gateway: true,
        }
    }
}

/// What [`Reconciler::resolve`] did to the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub view: PaymentStatusView,
    /// `false` when the order already had the requested final status.
    pub changed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Plan {
    Apply,
    AlreadyApplied,
}

/// Decides what `resolution` does to `order` without touching storage.
pub(crate) fn plan(order: &Order, resolution: &Resolution) -> Result<Plan, ServiceError> {
    let target = resolution.outcome.order_status();
    if order.status == target {
        return Ok(Plan::AlreadyApplied);
    }
    if !order.status.can_transition_to(target) {
        return Err(ServiceError::InvalidTransition {
            from: order.status,
            to: target,
        });
    }
    if resolution.outcome == Outcome::Paid {
        if let Some(actual) = resolution.amount {
            if actual != order.total_amount {
                return Err(ServiceError::AmountMismatch {
                    expected: order.total_amount,
                    actual,
                });
            }
        }
    }
    Ok(Plan::Apply)
}

/// A gateway says it collected money for an order that is already closed.
pub(crate) fn is_late_payment(order: &Order, resolution: &Resolution) -> bool {
    resolution.from_gateway
        && resolution.outcome == Outcome::Paid
        && matches!(order.status, OrderStatus::Failed | OrderStatus::Cancelled)
}

/// Applies [`Resolution`]s: payment settlement and order status in one
/// transaction, stock and voucher released on failure or cancellation.
#[derive(Clone)]
pub struct Reconciler {
    db_pool: Pool,
    repos: Repositories,
    cache: StatusCache,
}

impl Reconciler {
    pub fn new(db_pool: Pool, repos: Repositories, cache: StatusCache) -> Self {
        Self {
            db_pool,
            repos,
            cache,
        }
    }

    /// Applies `resolution` to the order and returns the resulting status.
    ///
    /// Re-applying the status the order already has is a no-op that returns
    /// the current snapshot, so duplicated callbacks are harmless.
    pub async fn apply(
        &self,
        order_id: Uuid,
        resolution: Resolution,
    ) -> Result<PaymentStatusView, ServiceError> {
        self.resolve(order_id, resolution).await.map(|r| r.view)
    }

    /// Like [`Reconciler::apply`], but also tells whether anything changed.
    ///
    /// A payment reported for an order that already failed or was cancelled
    /// is written to the payment metadata and returned as
    /// [`ServiceError::LatePayment`], so the money can be refunded by hand.
    #[instrument(skip(self, resolution), fields(outcome = ?resolution.outcome))]
    pub async fn resolve(
        &self,
        order_id: Uuid,
        resolution: Resolution,
    ) -> Result<Reconciled, ServiceError> {
        let mut client = self.db_pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| ServiceError::Unexpected(format!("Begin transaction failed: {e}")))?;

        let mut order = self.repos.orders.lock_tx(&tx, order_id).await?;
        let mut payment = self.repos.payments.get_by_order_id_tx(&tx, order_id).await?;

        match plan(&order, &resolution) {
            Ok(Plan::Apply) => {}
            Ok(Plan::AlreadyApplied) => {
                debug!(status = %order.status, "resolution already applied");
                let view = PaymentStatusView::from_parts(&order, &payment);
                self.cache.put(view.clone()).await;
                return Ok(Reconciled {
                    view,
                    changed: false,
                });
            }
            Err(ServiceError::InvalidTransition { from, .. }) if is_late_payment(&order, &resolution) => {
                let note = format!(
                    "late payment after order was {from}: amount={} reference={} {}",
                    resolution.amount.map_or_else(|| "?".to_string(), |a| a.to_string()),
                    resolution.reference.as_deref().unwrap_or("?"),
                    resolution.note.as_deref().unwrap_or(""),
                );
                self.repos
                    .payments
                    .annotate_tx(&tx, order_id, note.trim_end())
                    .await?;
                tx.commit()
                    .await
                    .map_err(|e| ServiceError::Unexpected(format!("Commit failed: {e}")))?;
                error!(
                    status = %from,
                    amount = ?resolution.amount,
                    reference = ?resolution.reference,
                    "payment received for a closed order, refund needed"
                );
                return Err(ServiceError::LatePayment {
                    order_id,
                    status: from,
                });
            }
            Err(err) => {
                warn!(status = %order.status, error = %err, "resolution rejected");
                return Err(err);
            }
        }

        let target = resolution.outcome.order_status();
        let settlement = Settlement {
            status: resolution.outcome.payment_status(),
            paid_at: (resolution.outcome == Outcome::Paid).then(Utc::now),
            gateway_reference: resolution.reference.clone(),
            metadata: resolution.note.clone(),
        };
        if self.repos.payments.settle_tx(&tx, order_id, &settlement).await? {
            payment.status = settlement.status;
            payment.paid_at = settlement.paid_at;
            payment.metadata = settlement.metadata;
            if settlement.gateway_reference.is_some() {
                payment.gateway_reference = settlement.gateway_reference;
            }
        }
        self.repos.orders.update_status_tx(&tx, order_id, target).await?;

        if resolution.outcome.releases_reservations() {
            self.release_reservations(&tx, &order).await?;
        }

        tx.commit()
            .await
            .map_err(|e| ServiceError::Unexpected(format!("Commit failed: {e}")))?;

        info!(from = %order.status, to = %target, "order reconciled");
        order.status = target;
        let view = PaymentStatusView::from_parts(&order, &payment);
        self.cache.put(view.clone()).await;
        Ok(Reconciled {
            view,
            changed: true,
        })
    }

    /// Puts reserved stock back and returns the voucher use.
    async fn release_reservations(
        &self,
        tx: &Transaction<'_>,
        order: &Order,
    ) -> Result<(), ServiceError> {
        let lines = self.repos.order_products.get_by_order_id_tx(tx, order.id).await?;
        for line in &lines {
            self.repos
                .variants
                .release_stock_tx(tx, line.variant_id, line.quantity)
                .await?;
        }
        if let Some(code) = order.voucher_code.as_deref() {
            self.repos.vouchers.release_tx(tx, code).await?;
        }
        debug!(lines = lines.len(), voucher = ?order.voucher_code, "reservations released");
        Ok(())
    }
}
