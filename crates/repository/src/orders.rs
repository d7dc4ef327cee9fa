use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use model::{Order, OrderProduct, OrderStatus, PaymentMethod, Recipient};
use tokio_postgres::{Row, Transaction};
use uuid::Uuid;

use crate::{RepositoryError, parse_column};

const ORDER_COLUMNS: &str = "id, user_id, status, subtotal, shipping_fee, discount, payment_fee, \
    total_amount, voucher_code, recipient_name, recipient_phone, recipient_address, \
    recipient_note, created_at, updated_at";

/// Optional filters for the admin order listing.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub user_id: Option<String>,
}

/// An unfinished order whose gateway payment ran past its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleOrder {
    pub order_id: Uuid,
    pub method: PaymentMethod,
}

/// # OrdersRepository
///
/// Orders are the main aggregates: they carry the recipient snapshot,
/// the price breakdown and the lifecycle status.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    async fn insert_tx(&self, tx: &Transaction<'_>, order: &Order) -> Result<(), RepositoryError>;
    async fn get_by_id(&self, order_id: Uuid) -> Result<Order, RepositoryError>;

    /// Reads the order and holds a row lock until `tx` ends.
    async fn lock_tx(&self, tx: &Transaction<'_>, order_id: Uuid) -> Result<Order, RepositoryError>;

    async fn update_status_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<(), RepositoryError>;

    /// Moves the order from `from` to `to` only if it is still in `from`.
    /// Returns `false` when another writer got there first.
    async fn advance_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, RepositoryError>;

    async fn list(&self, filter: &OrderFilter, limit: i64, offset: i64) -> Result<Vec<Order>, RepositoryError>;

    /// Unfinished orders whose gateway payment is still pending and which
    /// were created before `cutoff`, oldest first.
    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StaleOrder>, RepositoryError>;
}

/// PostgreSQL implementation of the OrdersRepository trait.
#[derive(Clone)]
pub struct PgOrdersRepository {
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn order_from_row(row: &Row) -> Result<Order, RepositoryError> {
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status: parse_column(row, "status")?,
        subtotal: row.try_get("subtotal")?,
        shipping_fee: row.try_get("shipping_fee")?,
        discount: row.try_get("discount")?,
        payment_fee: row.try_get("payment_fee")?,
        total_amount: row.try_get("total_amount")?,
        voucher_code: row.try_get("voucher_code")?,
        recipient: Recipient {
            name: row.try_get("recipient_name")?,
            phone: row.try_get("recipient_phone")?,
            address: row.try_get("recipient_address")?,
            note: row.try_get("recipient_note")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn insert_tx(&self, tx: &Transaction<'_>, order: &Order) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO orders (
                id, user_id, status, subtotal, shipping_fee, discount, payment_fee,
                total_amount, voucher_code, recipient_name, recipient_phone,
                recipient_address, recipient_note, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
        "#;
        tx.execute(query, &[
            &order.id,
            &order.user_id,
            &order.status.as_str(),
            &order.subtotal,
            &order.shipping_fee,
            &order.discount,
            &order.payment_fee,
            &order.total_amount,
            &order.voucher_code,
            &order.recipient.name,
            &order.recipient.phone,
            &order.recipient.address,
            &order.recipient.note,
            &order.created_at,
            &order.updated_at,
        ]).await?;
        Ok(())
    }

    async fn get_by_id(&self, order_id: Uuid) -> Result<Order, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        match client.query_opt(query.as_str(), &[&order_id]).await? {
            Some(row) => order_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn lock_tx(&self, tx: &Transaction<'_>, order_id: Uuid) -> Result<Order, RepositoryError> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
        match tx.query_opt(query.as_str(), &[&order_id]).await? {
            Some(row) => order_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn update_status_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<(), RepositoryError> {
        let updated = tx
            .execute(
                "UPDATE orders SET status = $2, updated_at = now() WHERE id = $1",
                &[&order_id, &status.as_str()],
            )
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn advance_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, RepositoryError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE orders SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
                &[&order_id, &from.as_str(), &to.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn list(&self, filter: &OrderFilter, limit: i64, offset: i64) -> Result<Vec<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE ($1::TEXT IS NULL OR status = $1) AND ($2::TEXT IS NULL OR user_id = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        );
        let status = filter.status.map(OrderStatus::as_str);
        let rows = client
            .query(query.as_str(), &[&status, &filter.user_id, &limit, &offset])
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StaleOrder>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT o.id, p.method
            FROM orders o JOIN payments p ON p.order_id = o.id
            WHERE o.status IN ('pending', 'awaiting_confirmation')
              AND p.status = 'pending'
              AND p.method <> 'cod'
              AND o.created_at < $1
            ORDER BY o.created_at
            LIMIT $2
        "#;
        let rows = client.query(query, &[&cutoff, &limit]).await?;
        rows.iter()
            .map(|row| {
                Ok(StaleOrder {
                    order_id: row.try_get("id")?,
                    method: parse_column(row, "method")?,
                })
            })
            .collect()
    }
}

/// # OrderProductsRepository
///
/// Order lines link an order to a variant with the quantity and the
/// unit price captured at order time.
#[async_trait]
pub trait OrderProductsRepository: Send + Sync {
    async fn insert_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        lines: &[OrderProduct],
    ) -> Result<(), RepositoryError>;
    async fn get_by_order_id(&self, order_id: Uuid) -> Result<Vec<OrderProduct>, RepositoryError>;
    async fn get_by_order_id_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
    ) -> Result<Vec<OrderProduct>, RepositoryError>;
}

const ORDER_PRODUCTS_QUERY: &str = r#"
    SELECT variant_id, product_name, size, color, quantity, unit_price, line_total
    FROM order_products WHERE order_id = $1 ORDER BY id
"#;

fn order_product_from_row(row: &Row) -> Result<OrderProduct, RepositoryError> {
    Ok(OrderProduct {
        variant_id: row.try_get("variant_id")?,
        product_name: row.try_get("product_name")?,
        size: row.try_get("size")?,
        color: row.try_get("color")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        line_total: row.try_get("line_total")?,
    })
}

/// PostgreSQL implementation of the OrderProductsRepository trait.
#[derive(Clone)]
pub struct PgOrderProductsRepository {
    pool: Pool,
}

impl PgOrderProductsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderProductsRepository for PgOrderProductsRepository {
    async fn insert_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        lines: &[OrderProduct],
    ) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO order_products (order_id, variant_id, product_name, size, color, quantity, unit_price, line_total)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#;
        let stmt = tx.prepare(query).await?;
        for line in lines {
            tx.execute(&stmt, &[
                &order_id, &line.variant_id, &line.product_name, &line.size,
                &line.color, &line.quantity, &line.unit_price, &line.line_total,
            ]).await?;
        }
        Ok(())
    }

    async fn get_by_order_id(&self, order_id: Uuid) -> Result<Vec<OrderProduct>, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = client.query(ORDER_PRODUCTS_QUERY, &[&order_id]).await?;
        rows.iter().map(order_product_from_row).collect()
    }

    async fn get_by_order_id_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
    ) -> Result<Vec<OrderProduct>, RepositoryError> {
        let rows = tx.query(ORDER_PRODUCTS_QUERY, &[&order_id]).await?;
        rows.iter().map(order_product_from_row).collect()
    }
}
