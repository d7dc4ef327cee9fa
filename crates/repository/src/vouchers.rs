use async_trait::async_trait;
use deadpool_postgres::Pool;
use model::{DiscountKind, Voucher};
use tokio_postgres::{Row, Transaction};

use crate::RepositoryError;

const VOUCHER_COLUMNS: &str = "code, kind, value, max_discount, min_order_value, usage_limit, \
    used_count, starts_at, ends_at, active";

/// # VouchersRepository
///
/// Discount codes. Redemption is a conditional increment so two checkouts
/// racing for the last use cannot both win.
#[async_trait]
pub trait VouchersRepository: Send + Sync {
    async fn get_by_code_tx(&self, tx: &Transaction<'_>, code: &str) -> Result<Voucher, RepositoryError>;
    async fn list(&self) -> Result<Vec<Voucher>, RepositoryError>;
    async fn insert(&self, voucher: &Voucher) -> Result<(), RepositoryError>;

    /// Consumes one use if any is left. Returns whether it did.
    async fn redeem_tx(&self, tx: &Transaction<'_>, code: &str) -> Result<bool, RepositoryError>;

    /// Gives back one use taken by [`VouchersRepository::redeem_tx`].
    async fn release_tx(&self, tx: &Transaction<'_>, code: &str) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the VouchersRepository trait.
#[derive(Clone)]
pub struct PgVouchersRepository {
    pool: Pool,
}

impl PgVouchersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn voucher_from_row(row: &Row) -> Result<Voucher, RepositoryError> {
    let kind: String = row.try_get("kind")?;
    Ok(Voucher {
        code: row.try_get("code")?,
        kind: DiscountKind::parse(&kind)
            .ok_or_else(|| RepositoryError::Corrupt(format!("kind: unknown discount kind '{kind}'")))?,
        value: row.try_get("value")?,
        max_discount: row.try_get("max_discount")?,
        min_order_value: row.try_get("min_order_value")?,
        usage_limit: row.try_get("usage_limit")?,
        used_count: row.try_get("used_count")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        active: row.try_get("active")?,
    })
}

#[async_trait]
impl VouchersRepository for PgVouchersRepository {
    async fn get_by_code_tx(&self, tx: &Transaction<'_>, code: &str) -> Result<Voucher, RepositoryError> {
        let query = format!("SELECT {VOUCHER_COLUMNS} FROM vouchers WHERE code = $1");
        match tx.query_opt(query.as_str(), &[&code]).await? {
            Some(row) => voucher_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list(&self) -> Result<Vec<Voucher>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {VOUCHER_COLUMNS} FROM vouchers ORDER BY ends_at DESC");
        let rows = client.query(query.as_str(), &[]).await?;
        rows.iter().map(voucher_from_row).collect()
    }

    async fn insert(&self, voucher: &Voucher) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO vouchers (
                code, kind, value, max_discount, min_order_value, usage_limit,
                used_count, starts_at, ends_at, active
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        "#;
        client.execute(query, &[
            &voucher.code,
            &voucher.kind.as_str(),
            &voucher.value,
            &voucher.max_discount,
            &voucher.min_order_value,
            &voucher.usage_limit,
            &voucher.used_count,
            &voucher.starts_at,
            &voucher.ends_at,
            &voucher.active,
        ]).await?;
        Ok(())
    }

    async fn redeem_tx(&self, tx: &Transaction<'_>, code: &str) -> Result<bool, RepositoryError> {
        let updated = tx
            .execute(
                "UPDATE vouchers SET used_count = used_count + 1 \
                 WHERE code = $1 AND active AND used_count < usage_limit",
                &[&code],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn release_tx(&self, tx: &Transaction<'_>, code: &str) -> Result<(), RepositoryError> {
        tx.execute(
            "UPDATE vouchers SET used_count = used_count - 1 WHERE code = $1 AND used_count > 0",
            &[&code],
        )
        .await?;
        Ok(())
    }
}
