//! Transactional retry executor.
//!
//! Runs caller operations inside a storage transaction obtained from a
//! [`crate::storage::UnitOfWork`], retries transient failures with a flat delay
//! and optionally deduplicates calls through the idempotency guard.

pub mod classify;
pub mod context;
pub mod error;
pub mod executor;
pub mod options;

pub use classify::{ErrorClass, ErrorClassifier, DEFAULT_NON_RETRYABLE_PATTERNS};
pub use context::TransactionContext;
pub use error::{ExecutionError, OperationError};
pub use executor::{BatchOperation, ExecutionOutcome, TransactionalExecutor, TxFuture, DEFAULT_SOURCE};
pub use options::ExecutorOptions;
