//! Transactional executor with bounded retry.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use wms_core::{CorrelationId, Payload};

use crate::idempotency::{IdempotencyGuard, IdempotencyKey, IdempotencyStore};
use crate::storage::{Transaction, UnitOfWork};

use super::classify::{ErrorClass, ErrorClassifier};
use super::context::TransactionContext;
use super::error::{ExecutionError, OperationError};
use super::options::ExecutorOptions;

/// Future returned by a transactional operation; borrows the open transaction.
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OperationError>> + Send + 'a>>;

/// Event source recorded on keys derived by the executor.
pub const DEFAULT_SOURCE: &str = "transactional_service";

/// Result of [`TransactionalExecutor::execute_with_transaction`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome<T> {
    pub result: T,
    /// Replayed from an earlier completed call; no attempt was made.
    pub was_duplicate: bool,
    pub attempts: u32,
    pub correlation_id: CorrelationId,
    pub elapsed: Duration,
}

/// A named step of [`TransactionalExecutor::execute_batch`].
pub struct BatchOperation<Tx, T> {
    name: String,
    run: Box<dyn for<'a> Fn(&'a mut Tx) -> TxFuture<'a, T> + Send + Sync>,
}

impl<Tx, T> BatchOperation<Tx, T> {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: for<'a> Fn(&'a mut Tx) -> TxFuture<'a, T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Tx, T> std::fmt::Debug for BatchOperation<Tx, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOperation").field("name", &self.name).finish()
    }
}

/// Runs operations inside storage transactions, retrying transient failures.
///
/// Each attempt gets its own transaction from the [`UnitOfWork`]: committed
/// when the operation returns `Ok`, rolled back otherwise. With idempotency on,
/// the guard wraps the whole retry loop, so a key is resolved once per call.
pub struct TransactionalExecutor<U, S> {
    uow: U,
    guard: Arc<IdempotencyGuard<S>>,
    classifier: ErrorClassifier,
}

impl<U, S> TransactionalExecutor<U, S>
where
    U: UnitOfWork,
    S: IdempotencyStore,
{
    pub fn new(uow: U, guard: Arc<IdempotencyGuard<S>>) -> Self {
        Self {
            uow,
            guard,
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn guard(&self) -> &Arc<IdempotencyGuard<S>> {
        &self.guard
    }

    pub fn unit_of_work(&self) -> &U {
        &self.uow
    }

    /// Run `operation` in a transaction, retrying retryable failures.
    ///
    /// Without an explicit `idempotency_key` (and with idempotency enabled) the
    /// key is derived from `(operation_name, payload, "transactional_service")`.
    pub async fn execute_with_transaction<T, F>(
        &self,
        operation_name: &str,
        payload: &Payload,
        operation: F,
        idempotency_key: Option<IdempotencyKey>,
        options: &ExecutorOptions,
    ) -> Result<ExecutionOutcome<T>, ExecutionError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'a> Fn(&'a mut U::Tx, &'a Payload) -> TxFuture<'a, T> + Send + Sync,
    {
        self.execute_from(DEFAULT_SOURCE, operation_name, payload, operation, idempotency_key, options)
            .await
    }

    pub(crate) async fn execute_from<T, F>(
        &self,
        source: &str,
        operation_name: &str,
        payload: &Payload,
        operation: F,
        idempotency_key: Option<IdempotencyKey>,
        options: &ExecutorOptions,
    ) -> Result<ExecutionOutcome<T>, ExecutionError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'a> Fn(&'a mut U::Tx, &'a Payload) -> TxFuture<'a, T> + Send + Sync,
    {
        let mut ctx = TransactionContext::new(operation_name, options.max_attempts());
        let correlation_id = ctx.correlation_id();

        if !options.use_idempotency {
            let attempt = ClosureAttempt::new(&operation, payload);
            let result = self.run_attempts(&mut ctx, &attempt, options).await?;
            return Ok(ExecutionOutcome {
                result,
                was_duplicate: false,
                attempts: ctx.attempt(),
                correlation_id,
                elapsed: ctx.elapsed(),
            });
        }

        let key = idempotency_key
            .unwrap_or_else(|| self.guard.generate_key(operation_name, payload, source));
        debug!(
            operation = operation_name,
            correlation_id = %correlation_id,
            key = %key,
            "executing with idempotency"
        );

        let outcome = {
            let ctx = &mut ctx;
            let operation = &operation;
            self.guard
                .process_with_idempotency(
                    &key,
                    operation_name,
                    source,
                    payload,
                    options.idempotency_ttl(),
                    move |payload| async move {
                        let attempt = ClosureAttempt::new(operation, &payload);
                        self.run_attempts(ctx, &attempt, options).await
                    },
                )
                .await?
        };

        Ok(ExecutionOutcome {
            result: outcome.result,
            was_duplicate: outcome.was_duplicate,
            attempts: ctx.attempt(),
            correlation_id,
            elapsed: ctx.elapsed(),
        })
    }

    /// Run named operations in one shared transaction, all or nothing.
    ///
    /// The first failing step rolls back every step and the call fails with
    /// [`ExecutionError::BatchAborted`]; no partial results are returned.
    /// Retryable failures re-run the whole batch. Idempotency is not applied.
    pub async fn execute_batch<T>(
        &self,
        operations: Vec<BatchOperation<U::Tx, T>>,
        options: &ExecutorOptions,
    ) -> Result<BTreeMap<String, T>, ExecutionError>
    where
        T: Send,
    {
        let mut names = BTreeSet::new();
        for op in &operations {
            if !names.insert(op.name.as_str()) {
                return Err(ExecutionError::InvalidBatch(format!(
                    "duplicate operation name '{}'",
                    op.name
                )));
            }
        }

        let mut ctx = TransactionContext::new("batch", options.max_attempts());
        let attempt = BatchAttempt {
            operations: &operations,
        };

        let outcome = self.run_attempts(&mut ctx, &attempt, options).await;
        match outcome {
            Ok(results) => Ok(results),
            Err(ExecutionError::NonRetryable { source, .. } | ExecutionError::RetriesExhausted { source, .. }) => {
                match source {
                    OperationError::BatchStep { name, source } => Err(ExecutionError::BatchAborted {
                        operation: name,
                        attempts: ctx.attempt(),
                        source: *source,
                    }),
                    other => Err(ExecutionError::BatchAborted {
                        operation: "batch".to_string(),
                        attempts: ctx.attempt(),
                        source: other,
                    }),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn run_attempts<A>(
        &self,
        ctx: &mut TransactionContext,
        operation: &A,
        options: &ExecutorOptions,
    ) -> Result<A::Output, ExecutionError>
    where
        A: Attempt<U::Tx>,
    {
        loop {
            let attempt = ctx.begin_attempt();
            let err = match self.attempt_once(operation, options.timeout).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = ctx.operation(),
                            correlation_id = %ctx.correlation_id(),
                            attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match self.classifier.classify(&err) {
                ErrorClass::NonRetryable => {
                    warn!(
                        operation = ctx.operation(),
                        correlation_id = %ctx.correlation_id(),
                        attempt,
                        error = %err,
                        "non-retryable failure"
                    );
                    return Err(ExecutionError::NonRetryable {
                        operation: ctx.operation().to_string(),
                        source: err,
                    });
                }
                ErrorClass::Retryable if ctx.has_budget() => {
                    warn!(
                        operation = ctx.operation(),
                        correlation_id = %ctx.correlation_id(),
                        attempt,
                        max_attempts = ctx.max_attempts(),
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(options.retry_delay).await;
                }
                ErrorClass::Retryable => {
                    warn!(
                        operation = ctx.operation(),
                        correlation_id = %ctx.correlation_id(),
                        attempt,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(ExecutionError::RetriesExhausted {
                        operation: ctx.operation().to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    async fn attempt_once<A>(&self, operation: &A, timeout: Option<Duration>) -> Result<A::Output, OperationError>
    where
        A: Attempt<U::Tx>,
    {
        let mut tx = self.uow.begin().await?;

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, operation.run(&mut tx))
                .await
                .unwrap_or(Err(OperationError::Timeout(limit))),
            None => operation.run(&mut tx).await,
        };

        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// One unit of work the retry loop can repeat against a fresh transaction.
trait Attempt<Tx>: Send + Sync {
    type Output;

    fn run<'a>(&'a self, tx: &'a mut Tx) -> TxFuture<'a, Self::Output>;
}

struct ClosureAttempt<'o, F, T> {
    operation: &'o F,
    payload: &'o Payload,
    _output: PhantomData<fn() -> T>,
}

impl<'o, F, T> ClosureAttempt<'o, F, T> {
    fn new(operation: &'o F, payload: &'o Payload) -> Self {
        Self {
            operation,
            payload,
            _output: PhantomData,
        }
    }
}

impl<Tx, F, T> Attempt<Tx> for ClosureAttempt<'_, F, T>
where
    F: for<'a> Fn(&'a mut Tx, &'a Payload) -> TxFuture<'a, T> + Send + Sync,
{
    type Output = T;

    fn run<'a>(&'a self, tx: &'a mut Tx) -> TxFuture<'a, T> {
        (self.operation)(tx, self.payload)
    }
}

struct BatchAttempt<'o, Tx, T> {
    operations: &'o [BatchOperation<Tx, T>],
}

impl<Tx, T> Attempt<Tx> for BatchAttempt<'_, Tx, T>
where
    Tx: Send,
    T: Send,
{
    type Output = BTreeMap<String, T>;

    fn run<'a>(&'a self, tx: &'a mut Tx) -> TxFuture<'a, Self::Output> {
        Box::pin(run_batch(self.operations, tx))
    }
}

async fn run_batch<Tx, T>(
    operations: &[BatchOperation<Tx, T>],
    tx: &mut Tx,
) -> Result<BTreeMap<String, T>, OperationError> {
    let mut results = BTreeMap::new();
    for op in operations {
        match (op.run)(tx).await {
            Ok(value) => {
                results.insert(op.name.clone(), value);
            }
            Err(err) => {
                return Err(OperationError::BatchStep {
                    name: op.name.clone(),
                    source: Box::new(err),
                });
            }
        }
    }
    Ok(results)
}
