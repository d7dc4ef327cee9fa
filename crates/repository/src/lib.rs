//! # Data Repository Layer
//!
//! This module provides repository traits and PostgreSQL implementations
//! for all entities: orders, order lines, payments, variants and vouchers.
//! Writes that take part in checkout or reconciliation come in a `*_tx`
//! flavour so the service layer can group them in one transaction.

use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::error::SqlState;

mod orders;
mod payments;
mod variants;
mod vouchers;

pub use orders::{
    OrderFilter, OrderProductsRepository, OrdersRepository, PgOrderProductsRepository,
    PgOrdersRepository, StaleOrder,
};
pub use payments::{PaymentsRepository, PgPaymentsRepository, Settlement};
pub use variants::{PgVariantsRepository, VariantsRepository};
pub use vouchers::{PgVouchersRepository, VouchersRepository};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// No connection could be taken from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// A stored value could not be mapped back to the domain model.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl RepositoryError {
    /// True when an INSERT hit a primary key or unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, RepositoryError::Db(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION))
    }
}

/// Parses a TEXT column holding one of the domain enums.
pub(crate) fn parse_column<T>(row: &tokio_postgres::Row, column: &str) -> Result<T, RepositoryError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: T::Err| RepositoryError::Corrupt(format!("{column}: {e}")))
}
