//! Idempotent processing of incoming warehouse events.
//!
//! An envelope may be delivered more than once (queue redelivery, client
//! retries). The processor keys each envelope by
//! `(event_type, payload, source)`, runs the handler through the
//! transactional executor with idempotency forced on, and republishes the
//! envelope downstream only after the first successful run.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use wms_core::Payload;
use wms_events::{EventBus, EventEnvelope};

use crate::idempotency::IdempotencyStore;
use crate::storage::UnitOfWork;
use crate::transactional::{ExecutionError, ExecutionOutcome, ExecutorOptions, TransactionalExecutor, TxFuture};

/// Result of [`EventProcessor::process`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent<T> {
    pub outcome: ExecutionOutcome<T>,
    /// Whether the envelope was handed to the downstream bus.
    pub published: bool,
}

pub struct EventProcessor<U, S, B> {
    executor: TransactionalExecutor<U, S>,
    bus: B,
    options: ExecutorOptions,
}

impl<U, S, B> EventProcessor<U, S, B>
where
    U: UnitOfWork,
    S: IdempotencyStore,
    B: EventBus<EventEnvelope>,
{
    pub fn new(executor: TransactionalExecutor<U, S>, bus: B, options: ExecutorOptions) -> Self {
        Self {
            executor,
            bus,
            options: options.with_idempotency(true),
        }
    }

    pub fn executor(&self) -> &TransactionalExecutor<U, S> {
        &self.executor
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Handle `envelope` at most once and publish it after the first success.
    ///
    /// A publish failure is logged and reported through
    /// [`ProcessedEvent::published`]; the handler's committed work stands.
    pub async fn process<T, F>(
        &self,
        envelope: &EventEnvelope,
        handler: F,
    ) -> Result<ProcessedEvent<T>, ExecutionError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'a> Fn(&'a mut U::Tx, &'a Payload) -> TxFuture<'a, T> + Send + Sync,
    {
        let key = self
            .executor
            .guard()
            .generate_key(envelope.event_type(), envelope.payload(), envelope.source());

        let outcome = self
            .executor
            .execute_from(
                envelope.source(),
                envelope.event_type(),
                envelope.payload(),
                handler,
                Some(key),
                &self.options,
            )
            .await?;

        if outcome.was_duplicate {
            debug!(
                event_id = %envelope.event_id(),
                event_type = envelope.event_type(),
                "duplicate event skipped"
            );
            return Ok(ProcessedEvent {
                outcome,
                published: false,
            });
        }

        let published = match self.bus.publish(envelope.clone()) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    event_id = %envelope.event_id(),
                    event_type = envelope.event_type(),
                    error = ?e,
                    "failed to publish processed event"
                );
                false
            }
        };

        Ok(ProcessedEvent { outcome, published })
    }
}
