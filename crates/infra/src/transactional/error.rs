//! Operation and execution errors.

use std::time::Duration;

use thiserror::Error;

use wms_core::DomainError;

use crate::idempotency::{IdempotencyKey, IdempotencyStatus, IdempotencyStoreError};
use crate::storage::StorageError;

/// Failure raised by a caller-supplied operation.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The attempt ran past the configured deadline and was rolled back.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// A named batch step failed; the whole batch was rolled back.
    #[error("batch step '{name}' failed: {source}")]
    BatchStep {
        name: String,
        #[source]
        source: Box<OperationError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OperationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Opaque failure from a message.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(anyhow::anyhow!(msg.into()))
    }
}

/// Failure of a guarded or transactional execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Another caller holds the key and has not finished.
    #[error("operation with idempotency key {key} is already in flight")]
    DuplicateInFlight { key: IdempotencyKey },

    /// The key already resolved to `failed`; the operation is not re-run.
    #[error("operation with idempotency key {key} previously failed: {message}")]
    PreviousFailure { key: IdempotencyKey, message: String },

    #[error("idempotency key {key} has unrecognized status '{status}'")]
    UnknownKeyState {
        key: IdempotencyKey,
        status: IdempotencyStatus,
    },

    #[error("operation '{operation}' failed with a non-retryable error: {source}")]
    NonRetryable {
        operation: String,
        #[source]
        source: OperationError,
    },

    #[error("operation '{operation}' failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: OperationError,
    },

    /// A batch step failed and the shared transaction was rolled back.
    #[error("batch aborted at '{operation}' after {attempts} attempt(s): {source}")]
    BatchAborted {
        operation: String,
        attempts: u32,
        #[source]
        source: OperationError,
    },

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// The wrapped operation failed (direct guard use, no executor).
    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Store(#[from] IdempotencyStoreError),

    /// An operation result could not be (de)serialized for the record.
    #[error("result serialization failed: {0}")]
    Result(String),
}

impl ExecutionError {
    pub fn is_duplicate_in_flight(&self) -> bool {
        matches!(self, ExecutionError::DuplicateInFlight { .. })
    }

    pub fn is_previous_failure(&self) -> bool {
        matches!(self, ExecutionError::PreviousFailure { .. })
    }

    pub fn is_non_retryable(&self) -> bool {
        matches!(self, ExecutionError::NonRetryable { .. })
    }

    /// The operation error behind this failure, if there is one.
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            ExecutionError::NonRetryable { source, .. }
            | ExecutionError::RetriesExhausted { source, .. }
            | ExecutionError::BatchAborted { source, .. }
            | ExecutionError::Operation(source) => Some(source),
            _ => None,
        }
    }
}
