//! Business logic layer for the checkout flow.
//!
//! This crate defines the [`CheckoutService`] trait and its implementation
//! [`CheckoutServiceImpl`], the [`Reconciler`] that moves orders and payments
//! to their final state, and the [`ExpirySweeper`] that cancels orders whose
//! payment window ran out.
//!
//! # Features
//! - Atomic order placement: stock reservation, voucher redemption and the
//!   order/line/payment rows are written in a single transaction.
//! - Forward-only, idempotent reconciliation of gateway callbacks and polls.
//! - Repository and gateway abstraction for loose coupling.
//! - Well-typed error handling via [`ServiceError`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Pool, PoolError};
use gateway::GatewayError;
use model::{
    Order, OrderDetails, OrderStatus, PaymentMethod, PaymentStatusView, Voucher, VoucherRejection,
};
use repository::{
    OrderProductsRepository, OrdersRepository, PaymentsRepository, PgOrderProductsRepository,
    PgOrdersRepository, PgPaymentsRepository, PgVariantsRepository, PgVouchersRepository,
    RepositoryError, VariantsRepository, VouchersRepository,
};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

mod checkout;
mod reconciler;
mod sweeper;

pub use checkout::{CheckoutLine, CheckoutReceipt, CheckoutRequest, CheckoutServiceImpl};
pub use reconciler::{Outcome, Reconciled, Reconciler, Resolution};
pub use repository::OrderFilter;
pub use sweeper::ExpirySweeper;

/// The main error type for all operations in [`CheckoutService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request is structurally or semantically invalid.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),
    /// The order does not exist or is not visible to the caller.
    #[error("Order not found")]
    NotFound,
    /// Not enough stock left for a line.
    #[error("Variant {variant_id} is out of stock")]
    OutOfStock { variant_id: i64 },
    /// The voucher cannot be applied to this order.
    #[error("Voucher rejected: {0}")]
    VoucherRejected(#[from] VoucherRejection),
    /// The requested status change would move the order backwards.
    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    /// A gateway collected money for an order that had already failed or
    /// been cancelled. Recorded on the payment for a manual refund.
    #[error("Payment received for {status} order {order_id}")]
    LatePayment { order_id: Uuid, status: OrderStatus },
    /// The gateway reported a different amount than the order total.
    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: i64, actual: i64 },
    /// A record with the same key already exists.
    #[error("Conflict: {0}")]
    Conflict(String),
    /// The payment gateway failed or refused the request.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
    /// A repository (database) operation failed.
    #[error("Database error: {0}")]
    Db(RepositoryError),
    /// Failed to obtain a database connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// Some unexpected or unhandled error.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ServiceError::NotFound,
            RepositoryError::Pool(e) => ServiceError::Pool(e),
            other => ServiceError::Db(other),
        }
    }
}

/// Who is calling: the authenticated user and whether they are an admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn can_access(&self, owner: &str) -> bool {
        self.is_admin || self.user_id == owner
    }
}

/// One page of a listing, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    #[serde(default = "Page::first")]
    pub page: u32,
    #[serde(default = "Page::default_size")]
    pub per_page: u32,
}

impl Page {
    pub const MAX_SIZE: u32 = 100;

    fn first() -> u32 {
        1
    }

    fn default_size() -> u32 {
        20
    }

    /// `(limit, offset)` with the page size clamped to `1..=MAX_SIZE`.
    pub fn limit_offset(self) -> (i64, i64) {
        let size = self.per_page.clamp(1, Self::MAX_SIZE);
        let page = self.page.max(1);
        (i64::from(size), i64::from(page - 1) * i64::from(size))
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: Self::first(),
            per_page: Self::default_size(),
        }
    }
}

/// Repositories shared by the checkout service, the reconciler and the sweeper.
#[derive(Clone)]
pub struct Repositories {
    pub orders: Arc<dyn OrdersRepository>,
    pub order_products: Arc<dyn OrderProductsRepository>,
    pub payments: Arc<dyn PaymentsRepository>,
    pub variants: Arc<dyn VariantsRepository>,
    pub vouchers: Arc<dyn VouchersRepository>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing `pool`.
    pub fn postgres(pool: &Pool) -> Self {
        Self {
            orders: Arc::new(PgOrdersRepository::new(pool.clone())),
            order_products: Arc::new(PgOrderProductsRepository::new(pool.clone())),
            payments: Arc::new(PgPaymentsRepository::new(pool.clone())),
            variants: Arc::new(PgVariantsRepository::new()),
            vouchers: Arc::new(PgVouchersRepository::new(pool.clone())),
        }
    }
}

/// Trait describing the business operations of the checkout backend.
#[async_trait]
pub trait CheckoutService: Send + Sync {
    /// Places an order for `caller` and starts its payment.
    ///
    /// # Errors
    /// Returns [`ServiceError::InvalidOrder`] if validation fails,
    /// [`ServiceError::OutOfStock`] / [`ServiceError::VoucherRejected`] if the
    /// cart cannot be honoured, and [`ServiceError::Gateway`] if the payment
    /// could not be created (the order is then failed).
    async fn place_order(
        &self,
        caller: &Caller,
        request: CheckoutRequest,
    ) -> Result<CheckoutReceipt, ServiceError>;

    async fn get_order(&self, caller: &Caller, order_id: Uuid) -> Result<OrderDetails, ServiceError>;

    async fn list_orders(&self, filter: &OrderFilter, page: Page) -> Result<Vec<Order>, ServiceError>;

    /// Current payment status. Pending gateway payments are checked against
    /// the gateway, and a definite answer is reconciled before returning.
    async fn payment_status(
        &self,
        caller: &Caller,
        order_id: Uuid,
    ) -> Result<PaymentStatusView, ServiceError>;

    async fn cancel_order(
        &self,
        caller: &Caller,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<PaymentStatusView, ServiceError>;

    /// Manual status change by an admin. Only final statuses can be set.
    async fn set_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        note: Option<String>,
    ) -> Result<PaymentStatusView, ServiceError>;

    /// Authenticates a gateway callback and reconciles its outcome.
    /// `changed` is false for a repeated callback.
    async fn handle_callback(
        &self,
        method: PaymentMethod,
        params: &BTreeMap<String, String>,
    ) -> Result<Reconciled, ServiceError>;

    async fn list_vouchers(&self) -> Result<Vec<Voucher>, ServiceError>;

    async fn create_voucher(&self, voucher: Voucher) -> Result<Voucher, ServiceError>;
}
