//! Idempotency record types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use wms_core::{DomainError, Payload};

/// Longest key accepted from callers (the column is `VARCHAR(255)`).
pub const MAX_KEY_LEN: usize = 255;

/// Identifies one logical operation attempt.
///
/// Usually a SHA-256 hex digest from [`super::KeyGenerator`]; callers may also
/// supply their own (e.g. an `Idempotency-Key` request header).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("idempotency key cannot be empty"));
        }
        if trimmed.len() > MAX_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency key longer than {MAX_KEY_LEN} bytes"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Wrap a digest produced inside this crate (already valid).
    pub(crate) fn from_digest(digest: String) -> Self {
        Self(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for IdempotencyKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Processing status of a record.
///
/// `Unknown` preserves whatever a corrupted or newer row carried so the guard
/// can report it instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Unknown(String),
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
            IdempotencyStatus::Unknown(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => IdempotencyStatus::Pending,
            "processing" => IdempotencyStatus::Processing,
            "completed" => IdempotencyStatus::Completed,
            "failed" => IdempotencyStatus::Failed,
            other => IdempotencyStatus::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IdempotencyStatus::Completed | IdempotencyStatus::Failed)
    }
}

impl core::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the idempotency table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub operation_name: String,
    pub event_source: String,
    pub payload: Payload,
    pub status: IdempotencyStatus,
    /// Serialized success value; always present once `Completed`.
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Time of the last status transition.
    pub updated_at: DateTime<Utc>,
    /// `created_at + ttl`.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A fresh `pending` record expiring `ttl` after `now`.
    pub fn pending(
        key: IdempotencyKey,
        operation_name: impl Into<String>,
        event_source: impl Into<String>,
        payload: Payload,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            operation_name: operation_name.into(),
            event_source: event_source.into(),
            payload,
            status: IdempotencyStatus::Pending,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            expires_at: add_std(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// `processing` with no transition for at least `abandon_after`.
    pub fn is_abandoned(&self, now: DateTime<Utc>, abandon_after: Duration) -> bool {
        self.status == IdempotencyStatus::Processing && add_std(self.updated_at, abandon_after) <= now
    }
}

/// `at + delta`, saturating at the maximum representable instant.
pub(crate) fn add_std(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delta)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - delta`, saturating at the minimum representable instant.
pub(crate) fn sub_std(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delta)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ttl: Duration) -> IdempotencyRecord {
        IdempotencyRecord::pending(
            IdempotencyKey::new("ship-42").unwrap(),
            "create_shipment",
            "test",
            Payload::new().with("order_id", 42),
            ttl,
            Utc::now(),
        )
    }

    #[test]
    fn key_validation() {
        assert!(IdempotencyKey::new("   ").is_err());
        assert!(IdempotencyKey::new("k".repeat(MAX_KEY_LEN + 1)).is_err());
        assert_eq!(IdempotencyKey::new("  abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::Processing,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::parse(status.as_str()), status);
        }
        assert_eq!(
            IdempotencyStatus::parse("archived"),
            IdempotencyStatus::Unknown("archived".to_string())
        );
    }

    #[test]
    fn zero_ttl_is_expired_immediately() {
        let r = record(Duration::ZERO);
        assert!(r.is_expired(r.created_at));
    }

    #[test]
    fn ttl_counts_from_creation() {
        let r = record(Duration::from_secs(3600));
        assert!(!r.is_expired(r.created_at + chrono::Duration::minutes(59)));
        assert!(r.is_expired(r.created_at + chrono::Duration::minutes(60)));
    }

    #[test]
    fn only_processing_records_can_be_abandoned() {
        let mut r = record(Duration::from_secs(3600));
        let later = r.updated_at + chrono::Duration::minutes(11);
        let limit = Duration::from_secs(600);

        assert!(!r.is_abandoned(later, limit));

        r.status = IdempotencyStatus::Processing;
        assert!(r.is_abandoned(later, limit));
        assert!(!r.is_abandoned(r.updated_at, limit));
    }

    #[test]
    fn huge_ttl_saturates() {
        let r = record(Duration::from_secs(u64::MAX));
        assert_eq!(r.expires_at, DateTime::<Utc>::MAX_UTC);
    }
}
