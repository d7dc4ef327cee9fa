use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use model::{Payment, PaymentStatus};
use tokio_postgres::{Row, Transaction};
use uuid::Uuid;

use crate::{RepositoryError, parse_column};

const PAYMENT_COLUMNS: &str = "id, order_id, method, status, amount, gateway_reference, pay_url, \
    paid_at, metadata, created_at, updated_at";

/// Terminal outcome written to a pending payment.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub gateway_reference: Option<String>,
    pub metadata: Option<String>,
}

/// # PaymentsRepository
///
/// One payment per order. A payment is created pending and settled once.
#[async_trait]
pub trait PaymentsRepository: Send + Sync {
    async fn insert_tx(&self, tx: &Transaction<'_>, payment: &Payment) -> Result<(), RepositoryError>;
    async fn get_by_order_id(&self, order_id: Uuid) -> Result<Payment, RepositoryError>;
    async fn get_by_order_id_tx(&self, tx: &Transaction<'_>, order_id: Uuid) -> Result<Payment, RepositoryError>;

    /// Stores what the gateway handed back for a pending payment.
    async fn attach_reference(
        &self,
        order_id: Uuid,
        reference: &str,
        pay_url: Option<&str>,
    ) -> Result<(), RepositoryError>;

    /// Settles a pending payment. Returns `false` if it was already settled.
    async fn settle_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        settlement: &Settlement,
    ) -> Result<bool, RepositoryError>;

    /// Appends a line to the payment's metadata without touching its status.
    async fn annotate_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        note: &str,
    ) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the PaymentsRepository trait.
#[derive(Clone)]
pub struct PgPaymentsRepository {
    pool: Pool,
}

impl PgPaymentsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn payment_from_row(row: &Row) -> Result<Payment, RepositoryError> {
    Ok(Payment {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        method: parse_column(row, "method")?,
        status: parse_column(row, "status")?,
        amount: row.try_get("amount")?,
        gateway_reference: row.try_get("gateway_reference")?,
        pay_url: row.try_get("pay_url")?,
        paid_at: row.try_get("paid_at")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PaymentsRepository for PgPaymentsRepository {
    async fn insert_tx(&self, tx: &Transaction<'_>, payment: &Payment) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO payments (
                id, order_id, method, status, amount, gateway_reference, pay_url,
                paid_at, metadata, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
        "#;
        tx.execute(query, &[
            &payment.id,
            &payment.order_id,
            &payment.method.as_str(),
            &payment.status.as_str(),
            &payment.amount,
            &payment.gateway_reference,
            &payment.pay_url,
            &payment.paid_at,
            &payment.metadata,
            &payment.created_at,
            &payment.updated_at,
        ]).await?;
        Ok(())
    }

    async fn get_by_order_id(&self, order_id: Uuid) -> Result<Payment, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1");
        match client.query_opt(query.as_str(), &[&order_id]).await? {
            Some(row) => payment_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_by_order_id_tx(&self, tx: &Transaction<'_>, order_id: Uuid) -> Result<Payment, RepositoryError> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 FOR UPDATE");
        match tx.query_opt(query.as_str(), &[&order_id]).await? {
            Some(row) => payment_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn attach_reference(
        &self,
        order_id: Uuid,
        reference: &str,
        pay_url: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE payments SET gateway_reference = $2, pay_url = $3, updated_at = now() \
                 WHERE order_id = $1 AND status = 'pending'",
                &[&order_id, &reference, &pay_url],
            )
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn settle_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        settlement: &Settlement,
    ) -> Result<bool, RepositoryError> {
        let query = r#"
            UPDATE payments
            SET status = $2,
                paid_at = $3,
                gateway_reference = COALESCE($4, gateway_reference),
                metadata = $5,
                updated_at = now()
            WHERE order_id = $1 AND status = 'pending'
        "#;
        let updated = tx
            .execute(query, &[
                &order_id,
                &settlement.status.as_str(),
                &settlement.paid_at,
                &settlement.gateway_reference,
                &settlement.metadata,
            ])
            .await?;
        Ok(updated == 1)
    }

    async fn annotate_tx(
        &self,
        tx: &Transaction<'_>,
        order_id: Uuid,
        note: &str,
    ) -> Result<(), RepositoryError> {
        let query = r#"
            UPDATE payments
            SET metadata = CASE WHEN metadata IS NULL OR metadata = '' THEN $2
                                ELSE metadata || E'\n' || $2 END,
                updated_at = now()
            WHERE order_id = $1
        "#;
        let updated = tx.execute(query, &[&order_id, &note]).await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
