//! Deterministic idempotency keys.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use wms_core::Payload;

use super::record::IdempotencyKey;

/// Top-level payload fields that change between retries of the same request.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &["timestamp", "created_at", "updated_at", "occurred_at"];

/// Derives an [`IdempotencyKey`] from `(operation, source, payload)`.
///
/// Volatile fields are removed from the top level of the payload, the rest is
/// serialized with sorted keys and the tuple is hashed with SHA-256. Field
/// order never matters; operation name and source always do.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    volatile_fields: BTreeSet<String>,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_FIELDS.iter().copied())
    }
}

impl KeyGenerator {
    pub fn new<I, S>(volatile_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            volatile_fields: volatile_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn volatile_fields(&self) -> impl Iterator<Item = &str> {
        self.volatile_fields.iter().map(String::as_str)
    }

    pub fn generate(&self, operation_name: &str, payload: &Payload, source: &str) -> IdempotencyKey {
        let stable = payload.without(self.volatile_fields());
        let material = serde_json::json!([operation_name, source, stable.to_json()]).to_string();
        IdempotencyKey::from_digest(hex::encode(Sha256::digest(material.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        Payload::try_from(value).unwrap()
    }

    #[test]
    fn field_order_is_irrelevant() {
        let keys = KeyGenerator::default();
        let a = keys.generate("op", &payload(json!({"a": 1, "b": 2})), "src");
        let b = keys.generate("op", &payload(json!({"b": 2, "a": 1})), "src");
        assert_eq!(a, b);
    }

    #[test]
    fn operation_and_source_are_part_of_the_key() {
        let keys = KeyGenerator::default();
        let p = payload(json!({"a": 1, "b": 2}));
        let base = keys.generate("op", &p, "src");

        assert_ne!(base, keys.generate("other_op", &p, "src"));
        assert_ne!(base, keys.generate("op", &p, "other_src"));
    }

    #[test]
    fn volatile_fields_are_ignored() {
        let keys = KeyGenerator::default();
        let first = keys.generate(
            "create_shipment",
            &payload(json!({"order_id": 42, "timestamp": "2026-10-17T08:00:00Z"})),
            "api",
        );
        let retry = keys.generate(
            "create_shipment",
            &payload(json!({"order_id": 42, "timestamp": "2026-10-17T08:00:05Z"})),
            "api",
        );
        assert_eq!(first, retry);
    }

    #[test]
    fn nested_volatile_names_are_kept() {
        let keys = KeyGenerator::default();
        let a = keys.generate("op", &payload(json!({"line": {"created_at": 1}})), "src");
        let b = keys.generate("op", &payload(json!({"line": {"created_at": 2}})), "src");
        assert_ne!(a, b);
    }

    #[test]
    fn custom_volatile_fields() {
        let keys = KeyGenerator::new(["request_id"]);
        let a = keys.generate("op", &payload(json!({"sku": "A", "request_id": "r1"})), "src");
        let b = keys.generate("op", &payload(json!({"sku": "A", "request_id": "r2"})), "src");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    proptest! {
        #[test]
        fn insertion_order_never_changes_the_key(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
        ) {
            let keys = KeyGenerator::default();

            let mut forward = Payload::new();
            for (k, v) in entries.iter() {
                forward.insert(k.clone(), *v);
            }
            let mut backward = Payload::new();
            for (k, v) in entries.iter().rev() {
                backward.insert(k.clone(), *v);
            }

            prop_assert_eq!(
                keys.generate("op", &forward, "src"),
                keys.generate("op", &backward, "src")
            );
        }
    }
}
