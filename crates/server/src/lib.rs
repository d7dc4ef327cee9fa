//! Server crate provides the HTTP API of the checkout backend.
//!
//! Checkout, order polling, cancellation, gateway callbacks (MoMo IPN, VNPay
//! IPN and browser return), admin order/voucher management, health and
//! Prometheus metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, patch, post},
};
use service::CheckoutService;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info};

pub mod auth;
pub mod error;
mod handlers;
pub mod metrics;

pub use auth::{ADMIN_ROLE, AuthUser, Claims, JwtKeys};
pub use error::{ApiError, Envelope};
pub use metrics::Metrics;

/// Application state shared between request handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn CheckoutService>,
    pub auth: Arc<JwtKeys>,
    pub metrics: Arc<Metrics>,
}

/// Builds the API router. Exposed for in-process tests.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/orders", post(handlers::place_order))
        .route("/api/payment/momo", post(handlers::create_momo_payment))
        .route("/api/payment/vnpay", post(handlers::create_vnpay_payment))
        .route("/api/payment/status/{order_id}", get(handlers::payment_status))
        .route("/api/order/{order_id}", get(handlers::get_order))
        .route("/api/order/{order_id}/cancel", post(handlers::cancel_order))
        .route("/api/payment/momo/ipn", post(handlers::momo_ipn))
        .route("/api/payment/vnpay/ipn", get(handlers::vnpay_ipn))
        .route("/api/payment/vnpay/return", get(handlers::vnpay_return))
        .route("/api/admin/orders", get(handlers::admin_list_orders))
        .route(
            "/api/admin/orders/{order_id}/status",
            patch(handlers::admin_set_status),
        )
        .route(
            "/api/admin/vouchers",
            get(handlers::admin_list_vouchers).post(handlers::admin_create_voucher),
        )
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.metrics.clone(),
            metrics::metrics_middleware,
        ))
        .with_state(state)
}

/// Server represents the HTTP server of the checkout API.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, state: AppState) -> Self {
        info!(port, "Initializing HTTP server");
        Self { port, state }
    }

    /// Serves until `shutdown` is notified, then drains in-flight requests.
    pub async fn start(self, shutdown: Arc<Notify>) -> Result<()> {
        let app = router(self.state);
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("Failed to bind to port {}", self.port))?;

        info!(port = self.port, "HTTP server listening");

        let stop = shutdown.notified_owned();
        axum::serve(listener, app)
            .with_graceful_shutdown(stop)
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
