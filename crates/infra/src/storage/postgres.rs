//! Postgres unit of work.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | `StorageError` |
//! |------------|----------|----------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (other) | any other | `Backend` |
//! | PoolTimedOut / PoolClosed / Io | n/a | `Connection` |
//! | Other | n/a | `Backend` |

use sqlx::{PgConnection, PgPool, Postgres};

use super::{StorageError, Transaction, UnitOfWork};

/// Hands out `sqlx` transactions from a shared pool.
#[derive(Debug, Clone)]
pub struct PgUnitOfWork {
    pool: PgPool,
}

impl PgUnitOfWork {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl UnitOfWork for PgUnitOfWork {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let inner = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgTransaction { inner })
    }
}

/// Open Postgres transaction. Dropping it without committing rolls back.
#[derive(Debug)]
pub struct PgTransaction {
    inner: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// Connection to run queries on, e.g. `query.execute(tx.conn())`.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.inner
    }
}

#[async_trait::async_trait]
impl Transaction for PgTransaction {
    async fn commit(self) -> Result<(), StorageError> {
        self.inner
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.inner
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

/// Map SQLx errors to `StorageError`.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StorageError::UniqueViolation(msg),
                Some("40001") | Some("40P01") => StorageError::Conflict(msg),
                _ => StorageError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StorageError::Connection(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StorageError::Connection(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(io) => StorageError::Connection(format!("io error in {}: {}", operation, io)),
        _ => StorageError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_transient() {
        assert!(map_sqlx_error("begin", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("begin", sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn row_not_found_is_a_backend_error() {
        let err = map_sqlx_error("select", sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::Backend(msg) if msg.contains("select")));
    }
}
