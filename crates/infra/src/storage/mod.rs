//! Unit-of-work boundary owned by the storage collaborator.
//!
//! The executor never reaches for a framework-global transaction. It receives
//! a [`UnitOfWork`], asks it for a [`Transaction`] per attempt, hands that
//! transaction to the caller's operation and then commits or rolls back.
//!
//! Serialization-conflict retries inside the database driver stay there; the
//! executor only sees the final [`StorageError`].

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

pub use in_memory::{InMemoryTransaction, InMemoryUnitOfWork, UnitOfWorkStats};
pub use postgres::{map_sqlx_error, PgTransaction, PgUnitOfWork};

/// Storage-level failure.
///
/// `Conflict` and `Connection` are transient; the other variants describe a
/// request that will fail the same way again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Serialization failure or deadlock; the transaction was aborted.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// A uniqueness constraint rejected the write.
    #[error("duplicate key: {0}")]
    UniqueViolation(String),

    /// The connection or pool is unavailable.
    #[error("connection unavailable: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Conflict(_) | StorageError::Connection(_))
    }
}

/// An open storage transaction.
#[async_trait::async_trait]
pub trait Transaction: Send {
    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}

/// Factory for storage transactions.
#[async_trait::async_trait]
pub trait UnitOfWork: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;
}

#[async_trait::async_trait]
impl<U> UnitOfWork for Arc<U>
where
    U: UnitOfWork + ?Sized,
{
    type Tx = U::Tx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        (**self).begin().await
    }
}
