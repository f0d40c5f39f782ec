//! At-most-once execution keyed by idempotency key.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use wms_core::Payload;

use crate::config::IdempotencyConfig;
use crate::transactional::ExecutionError;

use super::key::KeyGenerator;
use super::record::{sub_std, IdempotencyKey, IdempotencyRecord, IdempotencyStatus};
use super::store::{ClaimOutcome, IdempotencyStore, IdempotencyStoreError};

const ABANDONED_MESSAGE: &str = "abandoned: processing did not finish";

/// Result of a guarded call.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentOutcome<T> {
    pub result: T,
    /// `true` when the result was replayed from an earlier completed call.
    pub was_duplicate: bool,
}

/// Runs an operation at most once per key.
///
/// The guard claims the key through its [`IdempotencyStore`], runs the
/// operation outside the claim, then records the outcome. It never retries the
/// operation; retries belong to the caller.
pub struct IdempotencyGuard<S> {
    store: S,
    keys: KeyGenerator,
    abandon_after: Duration,
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub fn new(store: S, config: &IdempotencyConfig) -> Self {
        Self {
            store,
            keys: KeyGenerator::new(config.volatile_fields.iter().cloned()),
            abandon_after: config.abandon_after,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn generate_key(&self, operation_name: &str, payload: &Payload, source: &str) -> IdempotencyKey {
        self.keys.generate(operation_name, payload, source)
    }

    /// Live record for `key`, for diagnostics.
    pub async fn status(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        self.store.find(key, Utc::now()).await
    }

    /// Delete every record past its expiry.
    pub async fn cleanup_expired(&self) -> Result<u64, IdempotencyStoreError> {
        let deleted = self.store.delete_expired(Utc::now()).await?;
        if deleted > 0 {
            info!(deleted, "expired idempotency records removed");
        }
        Ok(deleted)
    }

    /// Run `operation` unless `key` already has a live record.
    ///
    /// - first caller: the operation runs; success stores the serialized result
    ///   (`completed`), failure stores the message (`failed`) and propagates.
    /// - `completed`: the stored result is returned with `was_duplicate`.
    /// - `failed`: [`ExecutionError::PreviousFailure`].
    /// - `processing`: [`ExecutionError::DuplicateInFlight`], or
    ///   `PreviousFailure` once the record is older than `abandon_after`.
    ///
    /// The outcome is written only to this caller's own claim. If the claim
    /// expired and was replaced meanwhile, the result is returned unrecorded.
    pub async fn process_with_idempotency<T, F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        operation_name: &str,
        source: &str,
        payload: &Payload,
        ttl: Duration,
        operation: F,
    ) -> Result<IdempotentOutcome<T>, ExecutionError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Payload) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ExecutionError>,
    {
        let claimed_at = loop {
            let now = Utc::now();
            let record = IdempotencyRecord::pending(
                key.clone(),
                operation_name,
                source,
                payload.clone(),
                ttl,
                now,
            );

            match self.store.claim(record, now).await? {
                ClaimOutcome::Claimed(claimed) => break claimed.created_at,
                ClaimOutcome::Existing(existing) => {
                    if let Some(outcome) = self.resolve_existing(existing).await? {
                        return Ok(outcome);
                    }
                    // The record moved under us; look again.
                }
            }
        };

        debug!(key = %key, operation = operation_name, "idempotency key claimed");

        match operation(payload.clone()).await.map_err(Into::into) {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(json) => {
                    match self.store.mark_completed(key, claimed_at, &json, Utc::now()).await {
                        Ok(()) => {}
                        // Our work is done; the key now belongs to a later claim.
                        Err(IdempotencyStoreError::ClaimLost(_)) => warn!(
                            key = %key,
                            operation = operation_name,
                            "claim expired before completion; result not recorded"
                        ),
                        Err(e) => return Err(e.into()),
                    }
                    Ok(IdempotentOutcome {
                        result,
                        was_duplicate: false,
                    })
                }
                Err(e) => {
                    let message = format!("result serialization failed: {e}");
                    self.record_failure(key, claimed_at, &message).await;
                    Err(ExecutionError::Result(e.to_string()))
                }
            },
            Err(err) => {
                self.record_failure(key, claimed_at, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// `None` when the record changed and the claim should be retried.
    async fn resolve_existing<T: DeserializeOwned>(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotentOutcome<T>>, ExecutionError> {
        match record.status {
            IdempotencyStatus::Completed => {
                let value = record.result.ok_or_else(|| IdempotencyStoreError::Corrupt {
                    key: record.key.clone(),
                    reason: "completed without a result".to_string(),
                })?;
                let result = serde_json::from_value(value).map_err(|e| ExecutionError::Result(e.to_string()))?;
                debug!(key = %record.key, "replaying completed result");
                Ok(Some(IdempotentOutcome {
                    result,
                    was_duplicate: true,
                }))
            }
            IdempotencyStatus::Failed => Err(ExecutionError::PreviousFailure {
                key: record.key,
                message: record.error_message.unwrap_or_default(),
            }),
            IdempotencyStatus::Processing => {
                let now = Utc::now();
                if !record.is_abandoned(now, self.abandon_after) {
                    return Err(ExecutionError::DuplicateInFlight { key: record.key });
                }

                let stale_before = sub_std(now, self.abandon_after);
                if self
                    .store
                    .abandon(&record.key, ABANDONED_MESSAGE, stale_before, now)
                    .await?
                {
                    warn!(
                        key = %record.key,
                        operation = %record.operation_name,
                        last_update = %record.updated_at,
                        "abandoned idempotency record marked failed"
                    );
                    return Err(ExecutionError::PreviousFailure {
                        key: record.key,
                        message: ABANDONED_MESSAGE.to_string(),
                    });
                }
                Ok(None)
            }
            IdempotencyStatus::Pending => Err(ExecutionError::DuplicateInFlight { key: record.key }),
            status @ IdempotencyStatus::Unknown(_) => Err(ExecutionError::UnknownKeyState {
                key: record.key,
                status,
            }),
        }
    }

    async fn record_failure(&self, key: &IdempotencyKey, claimed_at: DateTime<Utc>, message: &str) {
        if let Err(e) = self.store.mark_failed(key, claimed_at, message, Utc::now()).await {
            error!(key = %key, error = %e, "failed to record operation failure");
        }
    }
}
