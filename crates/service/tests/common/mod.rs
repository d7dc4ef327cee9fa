//! Shared setup for the database-backed service tests.
//!
//! Tests run only when `TEST_DATABASE_URL` points at a PostgreSQL server.
//! Each test gets its own schema, so they can run in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cache::StatusCache;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use gateway::{
    GatewayError, GatewayOutcome, GatewayReference, GatewayRegistry, OutcomeStatus,
    PaymentGateway, PaymentIntent,
};
use model::{PaymentMethod, PricingRules, Recipient};
use service::{Caller, CheckoutLine, CheckoutRequest, CheckoutServiceImpl, Repositories};
use tokio_postgres::{Config as PgConfig, NoTls};
use uuid::Uuid;

pub const USER: &str = "42";

pub struct TestDb {
    pub pool: Pool,
    admin: Pool,
    schema: String,
}

fn pool(config: PgConfig) -> Pool {
    let mgr = Manager::from_config(
        config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(mgr).max_size(4).build().unwrap()
}

/// Fresh, migrated schema, or `None` when no test database is configured.
pub async fn test_db() -> Option<TestDb> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping database test");
        return None;
    };
    let base: PgConfig = url.parse().expect("TEST_DATABASE_URL is not a Postgres URL");
    let schema = format!("checkout_test_{}", Uuid::new_v4().simple());

    let admin = pool(base.clone());
    admin
        .get()
        .await
        .unwrap()
        .batch_execute(&format!("CREATE SCHEMA {schema}"))
        .await
        .unwrap();

    let mut scoped = base;
    scoped.options(&format!("-c search_path={schema}"));
    let pool = pool(scoped);
    let client = pool.get().await.unwrap();
    db::run_migrations(&client, concat!(env!("CARGO_MANIFEST_DIR"), "/../../migrations"))
        .await
        .unwrap();

    Some(TestDb {
        pool,
        admin,
        schema,
    })
}

impl TestDb {
    pub async fn drop_schema(self) {
        self.pool.close();
        let client = self.admin.get().await.unwrap();
        client
            .batch_execute(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .await
            .unwrap();
    }

    /// Adds a variant priced at `price` with `stock` units and returns its id.
    pub async fn add_variant(&self, price: i64, stock: i32) -> i64 {
        let client = self.pool.get().await.unwrap();
        let row = client
            .query_one(
                "INSERT INTO variants (product_id, product_name, size, color, price, stock)
                 VALUES (1, 'Trail runner', '42', 'blue', $1, $2) RETURNING id",
                &[&price, &stock],
            )
            .await
            .unwrap();
        row.get(0)
    }

    /// Adds a 10% voucher valid around now.
    pub async fn add_voucher(&self, code: &str, usage_limit: i32) {
        let client = self.pool.get().await.unwrap();
        client
            .execute(
                "INSERT INTO vouchers (code, kind, value, usage_limit, starts_at, ends_at)
                 VALUES ($1, 'percent', 10, $2, now() - interval '1 day', now() + interval '1 day')",
                &[&code, &usage_limit],
            )
            .await
            .unwrap();
    }

    pub async fn stock(&self, variant_id: i64) -> i32 {
        let client = self.pool.get().await.unwrap();
        let row = client
            .query_one("SELECT stock FROM variants WHERE id = $1", &[&variant_id])
            .await
            .unwrap();
        row.get(0)
    }

    pub async fn voucher_uses(&self, code: &str) -> i32 {
        let client = self.pool.get().await.unwrap();
        let row = client
            .query_one("SELECT used_count FROM vouchers WHERE code = $1", &[&code])
            .await
            .unwrap();
        row.get(0)
    }

    /// Status of the only order placed by [`USER`].
    pub async fn user_order_status(&self) -> String {
        let client = self.pool.get().await.unwrap();
        let row = client
            .query_one("SELECT status FROM orders WHERE user_id = $1", &[&USER])
            .await
            .unwrap();
        row.get(0)
    }

    pub async fn payment_metadata(&self, order_id: Uuid) -> Option<String> {
        let client = self.pool.get().await.unwrap();
        let row = client
            .query_one("SELECT metadata FROM payments WHERE order_id = $1", &[&order_id])
            .await
            .unwrap();
        row.get(0)
    }

    /// Moves the order's creation time into the past.
    pub async fn backdate(&self, order_id: Uuid, minutes: i32) {
        let client = self.pool.get().await.unwrap();
        client
            .execute(
                "UPDATE orders SET created_at = now() - make_interval(mins => $2) WHERE id = $1",
                &[&order_id, &minutes],
            )
            .await
            .unwrap();
    }
}

/// Gateway double.
///
/// Callbacks carry `orderId`, optional `amount` and `status` (`paid` unless
/// `failed`). Status queries answer with `query_answer`.
#[derive(Default)]
pub struct StubGateway {
    pub create_fails: bool,
    pub query_answer: Option<OutcomeStatus>,
}

impl StubGateway {
    pub fn answering(status: OutcomeStatus) -> Self {
        Self {
            query_answer: Some(status),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Momo
    }

    async fn create_payment(&self, intent: &PaymentIntent) -> Result<GatewayReference, GatewayError> {
        if self.create_fails {
            return Err(GatewayError::Rejected {
                code: "99".into(),
                message: "unavailable".into(),
            });
        }
        Ok(GatewayReference {
            reference: format!("req-{}", intent.order_id.simple()),
            pay_url: Some("https://pay.example/checkout".into()),
            ..GatewayReference::default()
        })
    }

    async fn query_status(&self, order_id: Uuid) -> Result<Option<GatewayOutcome>, GatewayError> {
        Ok(self.query_answer.map(|status| GatewayOutcome {
            order_id,
            status,
            amount: None,
            transaction_ref: Some("txn-query".into()),
            message: "queried".into(),
        }))
    }

    fn verify_callback(&self, params: &BTreeMap<String, String>) -> Result<GatewayOutcome, GatewayError> {
        let order_id = params
            .get("orderId")
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| GatewayError::Malformed("orderId".into()))?;
        let status = match params.get("status").map(String::as_str) {
            Some("failed") => OutcomeStatus::Failed,
            _ => OutcomeStatus::Paid,
        };
        Ok(GatewayOutcome {
            order_id,
            status,
            amount: params.get("amount").and_then(|a| a.parse().ok()),
            transaction_ref: Some("txn-callback".into()),
            message: "callback".into(),
        })
    }
}

pub fn checkout_service(db: &TestDb, gateway: StubGateway) -> CheckoutServiceImpl {
    CheckoutServiceImpl::new(
        db.pool.clone(),
        Repositories::postgres(&db.pool),
        registry(gateway),
        StatusCache::new(16),
        PricingRules::default(),
    )
}

pub fn registry(gateway: StubGateway) -> GatewayRegistry {
    GatewayRegistry::new().with(Arc::new(gateway))
}

pub fn customer() -> Caller {
    Caller {
        user_id: USER.into(),
        is_admin: false,
    }
}

pub fn request(variant_id: i64, quantity: i32, method: PaymentMethod) -> CheckoutRequest {
    CheckoutRequest {
        recipient: Recipient {
            name: "Nguyen Van A".into(),
            phone: "0901234567".into(),
            address: "12 Le Loi, District 1".into(),
            note: None,
        },
        items: vec![CheckoutLine {
            variant_id,
            quantity,
        }],
        voucher_code: None,
        method,
        client_ip: Some("203.0.113.7".into()),
    }
}

pub fn callback(order_id: Uuid, amount: i64) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("orderId".to_string(), order_id.to_string()),
        ("amount".to_string(), amount.to_string()),
    ])
}
