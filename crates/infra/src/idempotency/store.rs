//! Idempotency record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::storage::StorageError;

use super::record::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus};

/// Idempotency store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyStoreError {
    /// The claim expired and its row was swept or re-claimed by another caller.
    #[error("claim on idempotency record {0} was lost")]
    ClaimLost(IdempotencyKey),

    /// A conditional status update found the row in another state.
    #[error("idempotency record {key} is '{actual}', expected '{expected}'")]
    InvalidTransition {
        key: IdempotencyKey,
        expected: IdempotencyStatus,
        actual: IdempotencyStatus,
    },

    #[error("idempotency record {key} is corrupt: {reason}")]
    Corrupt { key: IdempotencyKey, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of [`IdempotencyStore::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller inserted the row; it is now `processing`.
    Claimed(IdempotencyRecord),
    /// A live row already holds the key.
    Existing(IdempotencyRecord),
}

/// Persistence for idempotency records.
///
/// `claim` is the only place where two callers can race. Implementations must
/// make "is there a live row?" and "insert mine" one atomic step enforced by
/// the storage layer (unique constraint or equivalent), never by a lock that
/// only covers the current process.
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` as `pending` and move it to `processing`, unless a live
    /// row holds the key. An expired row for the key is replaced.
    async fn claim(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, IdempotencyStoreError>;

    /// Live (non-expired) record for `key`.
    async fn find(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError>;

    /// `processing → completed`, storing `result` in the same write.
    ///
    /// `claimed_at` is the `created_at` of the caller's claim; a row created by
    /// a later claim is never touched.
    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError>;

    /// `processing → failed`, storing `message`. Fenced like `mark_completed`.
    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError>;

    /// `processing → failed` only if the row has not moved since
    /// `stale_before`. Returns whether this call performed the transition.
    async fn abandon(
        &self,
        key: &IdempotencyKey,
        message: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyStoreError>;

    /// Delete every row with `expires_at <= now`, whatever its status.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyStoreError>;
}

#[async_trait::async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn claim(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, IdempotencyStoreError> {
        (**self).claim(record, now).await
    }

    async fn find(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        (**self).find(key, now).await
    }

    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        (**self).mark_completed(key, claimed_at, result, now).await
    }

    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        (**self).mark_failed(key, claimed_at, message, now).await
    }

    async fn abandon(
        &self,
        key: &IdempotencyKey,
        message: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyStoreError> {
        (**self).abandon(key, message, stale_before, now).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyStoreError> {
        (**self).delete_expired(now).await
    }
}

/// In-memory idempotency store for tests/dev.
///
/// One write lock covers the whole claim, which is atomic for every caller
/// sharing this instance (not across processes).
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store a record verbatim (fixtures, imports). Bypasses the state machine.
    pub fn put_raw(&self, record: IdempotencyRecord) -> Result<(), IdempotencyStoreError> {
        let mut records = self.write()?;
        records.insert(record.key.clone(), record);
        Ok(())
    }

    /// Every stored row, expired or not.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<IdempotencyKey, IdempotencyRecord>>, IdempotencyStoreError>
    {
        self.records
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()).into())
    }

    fn transition(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut IdempotencyRecord),
    ) -> Result<(), IdempotencyStoreError> {
        let mut records = self.write()?;
        let record = records
            .get_mut(key)
            .filter(|r| r.created_at == claimed_at)
            .ok_or_else(|| IdempotencyStoreError::ClaimLost(key.clone()))?;

        if record.status != IdempotencyStatus::Processing {
            return Err(IdempotencyStoreError::InvalidTransition {
                key: key.clone(),
                expected: IdempotencyStatus::Processing,
                actual: record.status.clone(),
            });
        }

        apply(record);
        record.updated_at = now;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn claim(
        &self,
        mut record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, IdempotencyStoreError> {
        let mut records = self.write()?;

        if let Some(existing) = records.get(&record.key) {
            if !existing.is_expired(now) {
                return Ok(ClaimOutcome::Existing(existing.clone()));
            }
        }

        // pending → processing happens before the lock is released.
        record.status = IdempotencyStatus::Pending;
        records.insert(record.key.clone(), record.clone());
        record.status = IdempotencyStatus::Processing;
        record.updated_at = now;
        records.insert(record.key.clone(), record.clone());

        Ok(ClaimOutcome::Claimed(record))
    }

    async fn find(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;
        Ok(records.get(key).filter(|r| !r.is_expired(now)).cloned())
    }

    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        self.transition(key, claimed_at, now, |record| {
            record.status = IdempotencyStatus::Completed;
            record.result = Some(result.clone());
            record.error_message = None;
        })
    }

    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        self.transition(key, claimed_at, now, |record| {
            record.status = IdempotencyStatus::Failed;
            record.error_message = Some(message.to_string());
        })
    }

    async fn abandon(
        &self,
        key: &IdempotencyKey,
        message: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyStoreError> {
        let mut records = self.write()?;
        match records.get_mut(key) {
            Some(record)
                if record.status == IdempotencyStatus::Processing
                    && record.updated_at <= stale_before
                    && !record.is_expired(now) =>
            {
                record.status = IdempotencyStatus::Failed;
                record.error_message = Some(message.to_string());
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyStoreError> {
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}
