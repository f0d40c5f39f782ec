//! Postgres-backed idempotency store.
//!
//! ## Claim
//!
//! `claim()` runs in one transaction:
//! 1. delete an expired row for the key, if any
//! 2. `INSERT ... 'pending' ON CONFLICT (idempotency_key) DO NOTHING`
//! 3. if the insert took, move the row to `processing`
//! 4. otherwise read the row that won
//!
//! The primary key on `idempotency_key` decides the race: a second inserter
//! blocks on the first one's uncommitted row and then sees the conflict.
//!
//! Status updates are compare-and-set on `processing_status = 'processing'`
//! and fenced on the claim's `created_at`, so an owner whose claim expired and
//! was replaced cannot finish the replacing claim.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use wms_core::Payload;

use crate::storage::{map_sqlx_error, StorageError};

use super::record::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus};
use super::store::{ClaimOutcome, IdempotencyStore, IdempotencyStoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    idempotency_key   VARCHAR(255) PRIMARY KEY,
    operation_name    TEXT NOT NULL,
    event_source      TEXT NOT NULL,
    payload           JSONB NOT NULL,
    processing_status TEXT NOT NULL,
    processing_result JSONB NULL,
    error_message     TEXT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    expires_at        TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires_at
    ON idempotency_keys (expires_at)
"#;

const SELECT_COLUMNS: &str = r#"
SELECT
    idempotency_key,
    operation_name,
    event_source,
    payload,
    processing_status,
    processing_result,
    error_message,
    created_at,
    updated_at,
    expires_at
FROM idempotency_keys
"#;

/// Idempotency records in the `idempotency_keys` table.
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and expiry index if missing.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_idempotency_table", e))?;
        sqlx::query(CREATE_EXPIRY_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_idempotency_index", e))?;
        Ok(())
    }

    /// Explain why a fenced update touched no row.
    ///
    /// The claim comparison stays in SQL so it sees the stored precision.
    async fn rejected_transition(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
    ) -> IdempotencyStoreError {
        let status = sqlx::query_scalar::<_, String>(
            "SELECT processing_status FROM idempotency_keys WHERE idempotency_key = $1 AND created_at = $2",
        )
        .bind(key.as_str())
        .bind(claimed_at)
        .fetch_optional(&self.pool)
        .await;

        match status {
            Ok(Some(status)) => IdempotencyStoreError::InvalidTransition {
                key: key.clone(),
                expected: IdempotencyStatus::Processing,
                actual: IdempotencyStatus::parse(&status),
            },
            Ok(None) => IdempotencyStoreError::ClaimLost(key.clone()),
            Err(e) => map_sqlx_error("load_idempotency_status", e).into(),
        }
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self, record), fields(key = %record.key, operation = %record.operation_name), err)]
    async fn claim(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, IdempotencyStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM idempotency_keys WHERE idempotency_key = $1 AND expires_at <= $2")
            .bind(record.key.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_expired_key", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (
                idempotency_key,
                operation_name,
                event_source,
                payload,
                processing_status,
                created_at,
                updated_at,
                expires_at
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.key.as_str())
        .bind(&record.operation_name)
        .bind(&record.event_source)
        .bind(record.payload.to_json())
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_idempotency_key", e))?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                r#"
                UPDATE idempotency_keys
                SET processing_status = 'processing', updated_at = $2
                WHERE idempotency_key = $1 AND processing_status = 'pending'
                "#,
            )
            .bind(record.key.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_processing", e))?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;

            return Ok(ClaimOutcome::Claimed(IdempotencyRecord {
                status: IdempotencyStatus::Processing,
                updated_at: now,
                ..record
            }));
        }

        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE idempotency_key = $1"))
            .bind(record.key.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_idempotency_key", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        match row {
            Some(row) => Ok(ClaimOutcome::Existing(IdempotencyRow::from_pg(&row)?.into_record()?)),
            // The winner's row was deleted between our insert and read.
            None => Err(StorageError::Conflict(format!(
                "idempotency key {} changed during claim",
                record.key
            ))
            .into()),
        }
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn find(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE idempotency_key = $1 AND expires_at > $2"
        ))
        .bind(key.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_idempotency_key", e))?;

        row.map(|row| IdempotencyRow::from_pg(&row)?.into_record())
            .transpose()
    }

    #[instrument(skip(self, result), fields(key = %key), err)]
    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET processing_status = 'completed',
                processing_result = $2,
                error_message = NULL,
                updated_at = $3
            WHERE idempotency_key = $1
              AND created_at = $4
              AND processing_status = 'processing'
            "#,
        )
        .bind(key.as_str())
        .bind(result)
        .bind(now)
        .bind(claimed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?
        .rows_affected();

        if updated == 1 {
            Ok(())
        } else {
            Err(self.rejected_transition(key, claimed_at).await)
        }
    }

    #[instrument(skip(self, message), fields(key = %key), err)]
    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        claimed_at: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET processing_status = 'failed',
                error_message = $2,
                updated_at = $3
            WHERE idempotency_key = $1
              AND created_at = $4
              AND processing_status = 'processing'
            "#,
        )
        .bind(key.as_str())
        .bind(message)
        .bind(now)
        .bind(claimed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?
        .rows_affected();

        if updated == 1 {
            Ok(())
        } else {
            Err(self.rejected_transition(key, claimed_at).await)
        }
    }

    #[instrument(skip(self, message), fields(key = %key), err)]
    async fn abandon(
        &self,
        key: &IdempotencyKey,
        message: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET processing_status = 'failed',
                error_message = $2,
                updated_at = $4
            WHERE idempotency_key = $1
              AND processing_status = 'processing'
              AND updated_at <= $3
              AND expires_at > $4
            "#,
        )
        .bind(key.as_str())
        .bind(message)
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("abandon_idempotency_key", e))?
        .rows_affected();

        Ok(updated == 1)
    }

    #[instrument(skip(self), err)]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyStoreError> {
        let deleted = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired_keys", e))?
            .rows_affected();
        Ok(deleted)
    }
}

struct IdempotencyRow {
    idempotency_key: String,
    operation_name: String,
    event_source: String,
    payload: JsonValue,
    processing_status: String,
    processing_result: Option<JsonValue>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl IdempotencyRow {
    fn from_pg(row: &sqlx::postgres::PgRow) -> Result<Self, IdempotencyStoreError> {
        let read = || -> Result<Self, sqlx::Error> {
            Ok(IdempotencyRow {
                idempotency_key: row.try_get("idempotency_key")?,
                operation_name: row.try_get("operation_name")?,
                event_source: row.try_get("event_source")?,
                payload: row.try_get("payload")?,
                processing_status: row.try_get("processing_status")?,
                processing_result: row.try_get("processing_result")?,
                error_message: row.try_get("error_message")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        };
        read().map_err(|e| map_sqlx_error("decode_idempotency_row", e).into())
    }

    fn into_record(self) -> Result<IdempotencyRecord, IdempotencyStoreError> {
        let key = IdempotencyKey::new(self.idempotency_key.clone()).map_err(|e| {
            IdempotencyStoreError::Corrupt {
                key: IdempotencyKey::from_digest(self.idempotency_key.clone()),
                reason: e.to_string(),
            }
        })?;
        let payload = Payload::try_from(self.payload).map_err(|e| IdempotencyStoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        Ok(IdempotencyRecord {
            key,
            operation_name: self.operation_name,
            event_source: self.event_source,
            payload,
            status: IdempotencyStatus::parse(&self.processing_status),
            result: self.processing_result,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Runs only when `DATABASE_URL` points at a disposable Postgres.
    async fn store() -> Option<PostgresIdempotencyStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        let store = PostgresIdempotencyStore::new(pool);
        store.ensure_schema().await.ok()?;
        Some(store)
    }

    fn record(ttl: Duration, now: DateTime<Utc>) -> IdempotencyRecord {
        let key = IdempotencyKey::new(format!("pg-test-{}", uuid::Uuid::now_v7())).unwrap();
        IdempotencyRecord::pending(
            key,
            "receive_pallet",
            "test",
            Payload::new().with("pallet", "P-1"),
            ttl,
            now,
        )
    }

    #[test]
    fn row_with_unknown_status_is_preserved() {
        let now = Utc::now();
        let row = IdempotencyRow {
            idempotency_key: "k".to_string(),
            operation_name: "op".to_string(),
            event_source: "src".to_string(),
            payload: serde_json::json!({"a": 1}),
            processing_status: "archived".to_string(),
            processing_result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            expires_at: now,
        };
        let record = row.into_record().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Unknown("archived".to_string()));
    }

    #[test]
    fn non_object_payload_is_corrupt() {
        let now = Utc::now();
        let row = IdempotencyRow {
            idempotency_key: "k".to_string(),
            operation_name: "op".to_string(),
            event_source: "src".to_string(),
            payload: serde_json::json!([1, 2]),
            processing_status: "completed".to_string(),
            processing_result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            expires_at: now,
        };
        assert!(matches!(row.into_record(), Err(IdempotencyStoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn claim_complete_and_replay_against_postgres() {
        let Some(store) = store().await else {
            return;
        };
        let now = Utc::now();
        let record = record(Duration::from_secs(60), now);
        let key = record.key.clone();

        let first = store.claim(record.clone(), now).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));
        let second = store.claim(record, now).await.unwrap();
        assert!(matches!(second, ClaimOutcome::Existing(ref r) if r.status == IdempotencyStatus::Processing));

        store.mark_completed(&key, now, &serde_json::json!({"ok": true}), now).await.unwrap();
        let err = store.mark_failed(&key, now, "late", now).await.unwrap_err();
        assert!(matches!(err, IdempotencyStoreError::InvalidTransition { .. }));

        let found = store.find(&key, now).await.unwrap().unwrap();
        assert_eq!(found.status, IdempotencyStatus::Completed);
        assert_eq!(found.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn replaced_claim_rejects_the_stale_owner() {
        let Some(store) = store().await else {
            return;
        };
        let first_at = Utc::now();
        let stale = record(Duration::ZERO, first_at);
        let key = stale.key.clone();
        store.claim(stale.clone(), first_at).await.unwrap();

        let second_at = first_at + chrono::Duration::milliseconds(10);
        let fresh = IdempotencyRecord::pending(
            key.clone(),
            "receive_pallet",
            "test",
            stale.payload.clone(),
            Duration::from_secs(60),
            second_at,
        );
        assert!(matches!(store.claim(fresh, second_at).await.unwrap(), ClaimOutcome::Claimed(_)));

        let err = store
            .mark_completed(&key, first_at, &serde_json::json!(111), second_at)
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyStoreError::ClaimLost(_)));

        store.mark_completed(&key, second_at, &serde_json::json!(222), second_at).await.unwrap();
        let found = store.find(&key, second_at).await.unwrap().unwrap();
        assert_eq!(found.result, Some(serde_json::json!(222)));
    }

    #[tokio::test]
    async fn expired_rows_are_invisible_and_swept() {
        let Some(store) = store().await else {
            return;
        };
        let now = Utc::now();
        let record = record(Duration::ZERO, now);
        let key = record.key.clone();

        store.claim(record, now).await.unwrap();
        assert!(store.find(&key, now).await.unwrap().is_none());
        assert!(store.delete_expired(now).await.unwrap() >= 1);
    }
}
