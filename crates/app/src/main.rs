//! Sports shop checkout backend.
//!
//! `serve` runs the HTTP API together with the expiry sweeper. `watch` follows
//! one order's payment status the way the storefront does, and `token` mints a
//! bearer token for local testing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use app_config::AppConfig;
use cache::StatusCache;
use gateway::{GatewayRegistry, MomoConfig, MomoGateway, VnpayConfig, VnpayGateway};
use poller::{HttpStatusSource, PollPolicy, PollState, Poller};
use server::{ADMIN_ROLE, AppState, JwtKeys, Metrics, Server};
use service::{CheckoutServiceImpl, ExpirySweeper, Repositories};

#[derive(Debug, Parser)]
#[command(name = "checkout", version, about = "Order and payment backend of the sports shop")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and the expiry sweeper (default).
    Serve,
    /// Poll an order's payment status until it is final.
    Watch {
        order_id: Uuid,
        /// API base URL, defaults to the local server.
        #[arg(long)]
        base_url: Option<String>,
        /// Bearer token; an admin token is minted from JWT_SECRET if omitted.
        #[arg(long)]
        token: Option<String>,
    },
    /// Print a bearer token.
    Token {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "user")]
        role: String,
        #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
        ttl: Duration,
    },
}

/// Initialize the tracing subscriber for logging.
fn init_logger(format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to initialize logger: {e}"))
}

fn build_gateways(config: &AppConfig) -> Result<GatewayRegistry> {
    let momo = MomoGateway::new(MomoConfig {
        endpoint: config.momo_endpoint.clone(),
        partner_code: config.momo_partner_code.clone(),
        access_key: config.momo_access_key.clone(),
        secret_key: config.momo_secret_key.clone(),
        redirect_url: config.momo_redirect_url.clone(),
        ipn_url: config.momo_ipn_url.clone(),
        timeout: config.gateway_timeout,
    })
    .context("Failed to build MoMo client")?;
    if !momo.is_configured() {
        warn!("MoMo credentials are not set, MoMo checkout will fail");
    }

    let vnpay = VnpayGateway::new(VnpayConfig {
        pay_url: config.vnpay_pay_url.clone(),
        tmn_code: config.vnpay_tmn_code.clone(),
        hash_secret: config.vnpay_hash_secret.clone(),
        return_url: config.vnpay_return_url.clone(),
    });
    if !vnpay.is_configured() {
        warn!("VNPay credentials are not set, VNPay checkout will fail");
    }

    Ok(GatewayRegistry::new()
        .with(Arc::new(momo))
        .with(Arc::new(vnpay)))
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Checkout backend starting...");
    let shutdown = Arc::new(Notify::new());

    let db_pool = db::init_db_pool(&config)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");

    let cache = StatusCache::new(config.status_cache_capacity);
    let repos = Repositories::postgres(&db_pool);
    let gateways = build_gateways(&config)?;
    let service = Arc::new(CheckoutServiceImpl::new(
        db_pool,
        repos.clone(),
        gateways.clone(),
        cache,
        config.pricing_rules(),
    ));
    let sweeper = ExpirySweeper::new(
        repos.orders.clone(),
        gateways,
        service.reconciler().clone(),
        config.pending_order_ttl,
        config.sweep_interval,
    );
    let state = AppState {
        service,
        auth: Arc::new(JwtKeys::new(&config.jwt_secret)),
        metrics: Arc::new(Metrics::new().context("Failed to register metrics")?),
    };

    let mut tasks = JoinSet::new();
    tasks.spawn(sweeper.run(shutdown.clone()));

    let http_server = Server::new(config.http_port, state);
    let server_shutdown = shutdown.clone();
    tasks.spawn(async move {
        if let Err(err) = http_server.start(server_shutdown).await {
            error!(error = %err, "HTTP server error");
        }
    });

    tokio::select! {
        _ = server::shutdown_signal() => {}
        Some(res) = tasks.join_next() => {
            if let Err(err) = res {
                error!(error = %err, "Task error");
            }
            warn!("A background task stopped, shutting down");
        }
    }
    shutdown.notify_waiters();

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(error = %err, "Task error");
            }
        }
    };
    if time::timeout(config.shutdown_timeout, drain).await.is_err() {
        warn!(timeout = ?config.shutdown_timeout, "Shutdown timed out, aborting tasks");
        tasks.abort_all();
    }

    info!("Application stopped");
    Ok(())
}

async fn watch(
    config: &AppConfig,
    order_id: Uuid,
    base_url: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let base_url = base_url.unwrap_or_else(|| format!("http://localhost:{}", config.http_port));
    let token = match token {
        Some(token) => token,
        None => JwtKeys::new(&config.jwt_secret)
            .issue("watch", ADMIN_ROLE, Duration::from_secs(3600))
            .context("Failed to issue token")?,
    };
    let source = HttpStatusSource::new(base_url, token, config.gateway_timeout)
        .context("Failed to build HTTP client")?;
    let poller = Poller::new(
        source,
        PollPolicy {
            interval: config.poll_interval,
            max_attempts: config.poll_max_attempts,
        },
    );

    let stop = Arc::new(Notify::new());
    let trigger = stop.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        trigger.notify_one();
    });

    let report = poller.run(order_id, stop).await;
    println!("{order_id}: {:?} after {} attempt(s)", report.state, report.attempts);
    match report.state {
        PollState::Paid => Ok(()),
        other => Err(anyhow!("payment not completed: {other:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_logger(&config.log_format)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Watch {
            order_id,
            base_url,
            token,
        } => watch(&config, order_id, base_url, token).await,
        Command::Token { user, role, ttl } => {
            let token = JwtKeys::new(&config.jwt_secret)
                .issue(&user, &role, ttl)
                .context("Failed to issue token")?;
            println!("{token}");
            Ok(())
        }
    }
}
