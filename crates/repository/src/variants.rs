use async_trait::async_trait;
use model::Variant;
use tokio_postgres::Transaction;

use crate::RepositoryError;

/// # VariantsRepository
///
/// Size/color SKUs with their current price and stock counter.
/// Stock changes are conditional single-statement updates so concurrent
/// checkouts can never drive the counter below zero.
#[async_trait]
pub trait VariantsRepository: Send + Sync {
    /// Loads the given variants; missing ids are simply absent from the result.
    async fn get_many_tx(&self, tx: &Transaction<'_>, ids: &[i64]) -> Result<Vec<Variant>, RepositoryError>;

    /// Takes `quantity` units if that many are in stock. Returns whether it did.
    async fn reserve_stock_tx(
        &self,
        tx: &Transaction<'_>,
        variant_id: i64,
        quantity: i32,
    ) -> Result<bool, RepositoryError>;

    /// Puts `quantity` units back.
    async fn release_stock_tx(
        &self,
        tx: &Transaction<'_>,
        variant_id: i64,
        quantity: i32,
    ) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the VariantsRepository trait.
#[derive(Clone, Default)]
pub struct PgVariantsRepository;

impl PgVariantsRepository {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VariantsRepository for PgVariantsRepository {
    async fn get_many_tx(&self, tx: &Transaction<'_>, ids: &[i64]) -> Result<Vec<Variant>, RepositoryError> {
        let query = r#"
            SELECT id, product_id, product_name, size, color, price, stock
            FROM variants WHERE id = ANY($1)
        "#;
        let rows = tx.query(query, &[&ids]).await?;
        let mut variants = Vec::with_capacity(rows.len());
        for row in rows {
            variants.push(Variant {
                id: row.try_get("id")?,
                product_id: row.try_get("product_id")?,
                product_name: row.try_get("product_name")?,
                size: row.try_get("size")?,
                color: row.try_get("color")?,
                price: row.try_get("price")?,
                stock: row.try_get("stock")?,
            });
        }
        Ok(variants)
    }

    async fn reserve_stock_tx(
        &self,
        tx: &Transaction<'_>,
        variant_id: i64,
        quantity: i32,
    ) -> Result<bool, RepositoryError> {
        let updated = tx
            .execute(
                "UPDATE variants SET stock = stock - $2 WHERE id = $1 AND stock >= $2",
                &[&variant_id, &quantity],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn release_stock_tx(
        &self,
        tx: &Transaction<'_>,
        variant_id: i64,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        tx.execute(
            "UPDATE variants SET stock = stock + $2 WHERE id = $1",
            &[&variant_id, &quantity],
        )
        .await?;
        Ok(())
    }
}
