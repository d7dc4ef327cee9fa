use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use cache::StatusCache;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use gateway::{GatewayError, GatewayRegistry, PaymentIntent};
use model::{
    MAX_SUBTOTAL, Order, OrderDetails, OrderProduct, OrderStatus, OrderTotals, Payment,
    PaymentMethod, PaymentStatus, PaymentStatusView, PricingRules, Recipient, Variant, Voucher,
    VoucherRejection,
};
use repository::{OrderFilter, RepositoryError};
use serde::{Deserialize, Serialize};
use tokio_postgres::Transaction;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    Caller, CheckoutService, Page, Reconciled, Reconciler, Repositories, Resolution, ServiceError,
};

/// One cart line as sent by the storefront.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutLine {
    pub variant_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub recipient: Recipient,
    pub items: Vec<CheckoutLine>,
    #[serde(default)]
    pub voucher_code: Option<String>,
    #[serde(default)]
    pub method: PaymentMethod,
    /// Filled in by the HTTP layer, VNPay wants it.
    #[serde(skip)]
    pub client_ip: Option<String>,
}

/// What the storefront needs to send the customer on to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub method: PaymentMethod,
    pub total_amount: i64,
    pub pay_url: Option<String>,
    pub qr_code_url: Option<String>,
    pub deeplink: Option<String>,
}

impl CheckoutReceipt {
    fn without_gateway(order: &Order, method: PaymentMethod) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            method,
            total_amount: order.total_amount,
            pay_url: None,
            qr_code_url: None,
            deeplink: None,
        }
    }
}

/// Validates the request and merges repeated variants.
///
/// Lines come back sorted by variant id, so concurrent checkouts lock
/// variant rows in the same order.
pub(crate) fn normalize_lines(request: &CheckoutRequest) -> Result<Vec<CheckoutLine>, ServiceError> {
    let recipient = &request.recipient;
    if recipient.name.trim().is_empty()
        || recipient.phone.trim().is_empty()
        || recipient.address.trim().is_empty()
    {
        return Err(ServiceError::InvalidOrder("invalid recipient data".into()));
    }
    if request.items.is_empty() {
        return Err(ServiceError::InvalidOrder("order has no items".into()));
    }

    let mut merged: BTreeMap<i64, i32> = BTreeMap::new();
    for line in &request.items {
        if line.quantity <= 0 {
            return Err(ServiceError::InvalidOrder(format!(
                "quantity for variant {} must be positive",
                line.variant_id
            )));
        }
        let quantity = merged.entry(line.variant_id).or_insert(0);
        *quantity = quantity.checked_add(line.quantity).ok_or_else(|| {
            ServiceError::InvalidOrder(format!("quantity for variant {} is too large", line.variant_id))
        })?;
    }
    Ok(merged
        .into_iter()
        .map(|(variant_id, quantity)| CheckoutLine { variant_id, quantity })
        .collect())
}

/// Snapshots each line at the variant's current price.
pub(crate) fn capture_lines(
    lines: &[CheckoutLine],
    variants: &[Variant],
) -> Result<Vec<OrderProduct>, ServiceError> {
    let by_id: HashMap<i64, &Variant> = variants.iter().map(|v| (v.id, v)).collect();
    lines
        .iter()
        .map(|line| {
            let variant = by_id.get(&line.variant_id).ok_or_else(|| {
                ServiceError::InvalidOrder(format!("unknown variant {}", line.variant_id))
            })?;
            if variant.stock < line.quantity {
                return Err(ServiceError::OutOfStock {
                    variant_id: variant.id,
                });
            }
            OrderProduct::capture(variant, line.quantity).ok_or_else(|| {
                ServiceError::InvalidOrder(format!("line total for variant {} is too large", variant.id))
            })
        })
        .collect()
}

/// Sum of the line totals, refused above [`MAX_SUBTOTAL`].
pub(crate) fn order_subtotal(products: &[OrderProduct]) -> Result<i64, ServiceError> {
    products
        .iter()
        .try_fold(0i64, |acc, p| acc.checked_add(p.line_total))
        .filter(|total| *total <= MAX_SUBTOTAL)
        .ok_or_else(|| ServiceError::InvalidOrder("order total is too large".into()))
}

/// Builds the order and payment rows.
///
/// Gateway orders start `pending` until the gateway hands back a payment
/// link. Cash on delivery needs no gateway and goes straight to
/// `awaiting_confirmation`; staff confirm it once the cash is collected.
pub(crate) fn draft(
    user_id: &str,
    recipient: Recipient,
    voucher_code: Option<String>,
    method: PaymentMethod,
    totals: OrderTotals,
    now: DateTime<Utc>,
) -> (Order, Payment) {
    let status = if method.uses_gateway() {
        OrderStatus::Pending
    } else {
        OrderStatus::AwaitingConfirmation
    };
    let order = Order {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        status,
        subtotal: totals.subtotal,
        shipping_fee: totals.shipping_fee,
        discount: totals.discount,
        payment_fee: totals.payment_fee,
        total_amount: totals.total_amount,
        voucher_code,
        recipient,
        created_at: now,
        updated_at: now,
    };
    let payment = Payment {
        id: Uuid::new_v4(),
        order_id: order.id,
        method,
        status: PaymentStatus::Pending,
        amount: totals.total_amount,
        gateway_reference: None,
        pay_url: None,
        paid_at: None,
        metadata: None,
        created_at: now,
        updated_at: now,
    };
    (order, payment)
}

/// Implementation of [`CheckoutService`] on top of PostgreSQL repositories
/// and the registered payment gateways.
pub struct CheckoutServiceImpl {
    db_pool: Pool,
    repos: Repositories,
    gateways: GatewayRegistry,
    cache: StatusCache,
    pricing: PricingRules,
    reconciler: Reconciler,
}

impl CheckoutServiceImpl {
    pub fn new(
        db_pool: Pool,
        repos: Repositories,
        gateways: GatewayRegistry,
        cache: StatusCache,
        pricing: PricingRules,
    ) -> Self {
        let reconciler = Reconciler::new(db_pool.clone(), repos.clone(), cache.clone());
        Self {
            db_pool,
            repos,
            gateways,
            cache,
            pricing,
            reconciler,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    async fn redeem_voucher(
        &self,
        tx: &Transaction<'_>,
        code: &str,
        subtotal: i64,
        now: DateTime<Utc>,
    ) -> Result<Voucher, ServiceError> {
        let voucher = match self.repos.vouchers.get_by_code_tx(tx, code).await {
            Ok(voucher) => voucher,
            Err(RepositoryError::NotFound) => return Err(VoucherRejection::Unknown.into()),
            Err(e) => return Err(e.into()),
        };
        voucher.check_applicable(subtotal, now)?;
        if !self.repos.vouchers.redeem_tx(tx, code).await? {
            return Err(VoucherRejection::Exhausted.into());
        }
        Ok(voucher)
    }

    /// Asks the gateway for a payment link. A failure fails the order.
    async fn start_gateway_payment(
        &self,
        order: &Order,
        method: PaymentMethod,
        client_ip: Option<String>,
    ) -> Result<CheckoutReceipt, ServiceError> {
        let intent = PaymentIntent {
            order_id: order.id,
            amount: order.total_amount,
            description: format!("Thanh toan don hang {}", order.id),
            client_ip,
        };
        let created = match self.gateways.get(method) {
            Some(gateway) => gateway.create_payment(&intent).await,
            None => Err(GatewayError::NotConfigured(method.as_str())),
        };
        let reference = match created {
            Ok(reference) => reference,
            Err(err) => {
                error!(order_id = %order.id, error = %err, "payment creation failed");
                let resolution = Resolution::failed(format!("payment creation failed: {err}"));
                if let Err(e) = self.reconciler.apply(order.id, resolution).await {
                    error!(order_id = %order.id, error = %e, "could not fail order");
                }
                return Err(err.into());
            }
        };

        match self
            .repos
            .payments
            .attach_reference(order.id, &reference.reference, reference.pay_url.as_deref())
            .await
        {
            Ok(()) => {}
            // Settled by a callback that beat us here.
            Err(RepositoryError::NotFound) => debug!(order_id = %order.id, "payment already settled"),
            Err(e) => return Err(e.into()),
        }

        let advanced = self
            .repos
            .orders
            .advance_status(order.id, OrderStatus::Pending, OrderStatus::AwaitingConfirmation)
            .await?;
        let status = if advanced {
            OrderStatus::AwaitingConfirmation
        } else {
            self.repos.orders.get_by_id(order.id).await?.status
        };

        info!(order_id = %order.id, %method, total = order.total_amount, "awaiting payment");
        Ok(CheckoutReceipt {
            order_id: order.id,
            status,
            method,
            total_amount: order.total_amount,
            pay_url: reference.pay_url,
            qr_code_url: reference.qr_code_url,
            deeplink: reference.deeplink,
        })
    }

    /// Asks the gateway about an open payment and reconciles a definite answer.
    async fn refresh_from_gateway(&self, view: PaymentStatusView) -> PaymentStatusView {
        let Some(gateway) = self.gateways.get(view.method) else {
            return view;
        };
        match gateway.query_status(view.order_id).await {
            Ok(Some(outcome)) => match self.reconciler.apply(view.order_id, outcome.into()).await {
                Ok(updated) => updated,
                Err(e) => {
                    warn!(order_id = %view.order_id, error = %e, "gateway outcome not applied");
                    view
                }
            },
            Ok(None) => view,
            Err(e) => {
                warn!(order_id = %view.order_id, error = %e, "gateway status query failed");
                view
            }
        }
    }
}

#[async_trait]
impl CheckoutService for CheckoutServiceImpl {
    #[instrument(skip(self, caller, request), fields(user_id = %caller.user_id, method = %request.method))]
    async fn place_order(
        &self,
        caller: &Caller,
        request: CheckoutRequest,
    ) -> Result<CheckoutReceipt, ServiceError> {
        let lines = normalize_lines(&request)?;
        let voucher_code = request
            .voucher_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_owned);
        let now = Utc::now();

        let mut client = self.db_pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| ServiceError::Unexpected(format!("Begin transaction failed: {e}")))?;

        let ids: Vec<i64> = lines.iter().map(|line| line.variant_id).collect();
        let variants = self.repos.variants.get_many_tx(&tx, &ids).await?;
        let products = capture_lines(&lines, &variants)?;
        for product in &products {
            let reserved = self
                .repos
                .variants
                .reserve_stock_tx(&tx, product.variant_id, product.quantity)
                .await?;
            if !reserved {
                return Err(ServiceError::OutOfStock {
                    variant_id: product.variant_id,
                });
            }
        }

        let subtotal = order_subtotal(&products)?;
        let voucher = match voucher_code.as_deref() {
            Some(code) => Some(self.redeem_voucher(&tx, code, subtotal, now).await?),
            None => None,
        };
        let totals = OrderTotals::compute(subtotal, voucher.as_ref(), request.method, &self.pricing);
        let (order, payment) = draft(
            &caller.user_id,
            request.recipient,
            voucher_code,
            request.method,
            totals,
            now,
        );

        self.repos.orders.insert_tx(&tx, &order).await?;
        self.repos
            .order_products
            .insert_tx(&tx, order.id, &products)
            .await?;
        self.repos.payments.insert_tx(&tx, &payment).await?;

        tx.commit()
            .await
            .map_err(|e| ServiceError::Unexpected(format!("Commit failed: {e}")))?;
        drop(client);

        info!(
            order_id = %order.id,
            subtotal = totals.subtotal,
            discount = totals.discount,
            total = totals.total_amount,
            "order placed"
        );

        if !request.method.uses_gateway() {
            return Ok(CheckoutReceipt::without_gateway(&order, request.method));
        }
        self.start_gateway_payment(&order, request.method, request.client_ip)
            .await
    }

    #[instrument(skip(self, caller))]
    async fn get_order(&self, caller: &Caller, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = self.repos.orders.get_by_id(order_id).await?;
        if !caller.can_access(&order.user_id) {
            return Err(ServiceError::NotFound);
        }
        let items = self.repos.order_products.get_by_order_id(order_id).await?;
        let payment = self.repos.payments.get_by_order_id(order_id).await?;
        Ok(OrderDetails {
            order,
            items,
            payment,
        })
    }

    #[instrument(skip(self))]
    async fn list_orders(&self, filter: &OrderFilter, page: Page) -> Result<Vec<Order>, ServiceError> {
        let (limit, offset) = page.limit_offset();
        Ok(self.repos.orders.list(filter, limit, offset).await?)
    }

    #[instrument(skip(self, caller))]
    async fn payment_status(
        &self,
        caller: &Caller,
        order_id: Uuid,
    ) -> Result<PaymentStatusView, ServiceError> {
        if let Some(view) = self.cache.get(&order_id).await {
            if !caller.can_access(&view.user_id) {
                return Err(ServiceError::NotFound);
            }
            return Ok(view);
        }

        let order = self.repos.orders.get_by_id(order_id).await?;
        if !caller.can_access(&order.user_id) {
            return Err(ServiceError::NotFound);
        }
        let payment = self.repos.payments.get_by_order_id(order_id).await?;
        let view = PaymentStatusView::from_parts(&order, &payment);
        if view.is_terminal() {
            self.cache.put(view.clone()).await;
            return Ok(view);
        }
        if !payment.method.uses_gateway() {
            return Ok(view);
        }
        Ok(self.refresh_from_gateway(view).await)
    }

    #[instrument(skip(self, caller, reason))]
    async fn cancel_order(
        &self,
        caller: &Caller,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<PaymentStatusView, ServiceError> {
        let order = self.repos.orders.get_by_id(order_id).await?;
        if !caller.can_access(&order.user_id) {
            return Err(ServiceError::NotFound);
        }
        let note = reason.unwrap_or_else(|| format!("cancelled by user {}", caller.user_id));
        self.reconciler
            .apply(order_id, Resolution::cancelled(note))
            .await
    }

    #[instrument(skip(self, note))]
    async fn set_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        note: Option<String>,
    ) -> Result<PaymentStatusView, ServiceError> {
        let note = note.unwrap_or_else(|| "set by admin".to_string());
        let resolution = match status {
            OrderStatus::Paid => Resolution::paid(None, None).with_note(note),
            OrderStatus::Failed => Resolution::failed(note),
            OrderStatus::Cancelled => Resolution::cancelled(note),
            OrderStatus::Pending | OrderStatus::AwaitingConfirmation => {
                return Err(ServiceError::InvalidOrder(format!(
                    "status {status} cannot be set manually"
                )));
            }
        };
        self.reconciler.apply(order_id, resolution).await
    }

    #[instrument(skip(self, params))]
    async fn handle_callback(
        &self,
        method: PaymentMethod,
        params: &BTreeMap<String, String>,
    ) -> Result<Reconciled, ServiceError> {
        let gateway = self
            .gateways
            .get(method)
            .ok_or(GatewayError::NotConfigured(method.as_str()))?;
        let outcome = gateway.verify_callback(params)?;
        info!(order_id = %outcome.order_id, status = ?outcome.status, "gateway callback verified");
        self.reconciler
            .resolve(outcome.order_id, outcome.into())
            .await
    }

    #[instrument(skip(self))]
    async fn list_vouchers(&self) -> Result<Vec<Voucher>, ServiceError> {
        Ok(self.repos.vouchers.list().await?)
    }

    #[instrument(skip(self, voucher), fields(code = %voucher.code))]
    async fn create_voucher(&self, mut voucher: Voucher) -> Result<Voucher, ServiceError> {
        validate_voucher(&voucher)?;
        voucher.code = voucher.code.trim().to_string();
        voucher.used_count = 0;
        match self.repos.vouchers.insert(&voucher).await {
            Ok(()) => Ok(voucher),
            Err(e) if e.is_unique_violation() => Err(ServiceError::Conflict(format!(
                "voucher {} already exists",
                voucher.code
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn validate_voucher(voucher: &Voucher) -> Result<(), ServiceError> {
    let invalid = |msg: &str| Err(ServiceError::InvalidOrder(format!("voucher: {msg}")));
    if voucher.code.trim().is_empty() {
        return invalid("code is empty");
    }
    if voucher.value <= 0 {
        return invalid("value must be positive");
    }
    if voucher.kind == model::DiscountKind::Percent && voucher.value > 100 {
        return invalid("percentage above 100");
    }
    if voucher.usage_limit <= 0 {
        return invalid("usage limit must be positive");
    }
    if voucher.starts_at >= voucher.ends_at {
        return invalid("validity window is empty");
    }
    Ok(())
}
