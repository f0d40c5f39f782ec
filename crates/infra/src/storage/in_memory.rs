//! In-memory unit of work for tests/dev.
//!
//! A transaction records its writes as a change log on top of the committed
//! key/value state. `commit` applies the log in order under one write lock;
//! `rollback` (or dropping the transaction) discards it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;

use super::{StorageError, Transaction, UnitOfWork};

#[derive(Debug, Clone)]
enum Change {
    Put { key: String, value: JsonValue },
    Delete { key: String },
}

impl Change {
    fn key(&self) -> &str {
        match self {
            Change::Put { key, .. } => key,
            Change::Delete { key } => key,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// Transaction counters, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitOfWorkStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

/// In-memory key/value storage with transactional writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUnitOfWork {
    state: Arc<RwLock<BTreeMap<String, JsonValue>>>,
    counters: Arc<Counters>,
}

impl InMemoryUnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a committed value.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.state.read().ok()?.get(key).cloned()
    }

    /// All committed entries, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, JsonValue> {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn stats(&self) -> UnitOfWorkStats {
        UnitOfWorkStats {
            begun: self.counters.begun.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            rolled_back: self.counters.rolled_back.load(Ordering::SeqCst),
        }
    }
}

#[async_trait::async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryTransaction {
            state: self.state.clone(),
            counters: self.counters.clone(),
            changes: Vec::new(),
        })
    }
}

/// Open in-memory transaction.
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<RwLock<BTreeMap<String, JsonValue>>>,
    counters: Arc<Counters>,
    changes: Vec<Change>,
}

impl InMemoryTransaction {
    /// Read through the change log, falling back to committed state.
    pub fn get(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        if let Some(change) = self.changes.iter().rev().find(|c| c.key() == key) {
            return Ok(match change {
                Change::Put { value, .. } => Some(value.clone()),
                Change::Delete { .. } => None,
            });
        }

        let state = self
            .state
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;
        Ok(state.get(key).cloned())
    }

    pub fn put(&mut self, key: impl Into<String>, value: JsonValue) {
        self.changes.push(Change::Put {
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.changes.push(Change::Delete { key: key.into() });
    }

    /// Insert only if the key is absent; mirrors a unique constraint.
    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) -> Result<(), StorageError> {
        let key = key.into();
        if self.get(&key)?.is_some() {
            return Err(StorageError::UniqueViolation(format!("key '{key}' already exists")));
        }
        self.put(key, value);
        Ok(())
    }

    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }
}

#[async_trait::async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(self) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;

        for change in self.changes {
            match change {
                Change::Put { key, value } => {
                    state.insert(key, value);
                }
                Change::Delete { key } => {
                    state.remove(&key);
                }
            }
        }

        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn commit_applies_changes_in_order() {
        let uow = InMemoryUnitOfWork::new();

        let mut tx = uow.begin().await.unwrap();
        tx.put("shipment:1", json!({"status": "draft"}));
        tx.put("shipment:1", json!({"status": "packed"}));
        tx.put("shipment:2", json!({"status": "draft"}));
        tx.delete("shipment:2");

        assert_eq!(tx.get("shipment:1").unwrap(), Some(json!({"status": "packed"})));
        assert!(uow.get("shipment:1").is_none());

        tx.commit().await.unwrap();

        assert_eq!(uow.get("shipment:1"), Some(json!({"status": "packed"})));
        assert!(uow.get("shipment:2").is_none());
        assert_eq!(uow.stats().committed, 1);
    }

    #[tokio::test]
    async fn rollback_discards_changes() {
        let uow = InMemoryUnitOfWork::new();

        let mut tx = uow.begin().await.unwrap();
        tx.put("pallet:9", json!(1));
        tx.rollback().await.unwrap();

        assert!(uow.snapshot().is_empty());
        assert_eq!(
            uow.stats(),
            UnitOfWorkStats {
                begun: 1,
                committed: 0,
                rolled_back: 1
            }
        );
    }

    #[tokio::test]
    async fn insert_rejects_existing_key() {
        let uow = InMemoryUnitOfWork::new();

        let mut tx = uow.begin().await.unwrap();
        tx.insert("sku:ABC", json!({"qty": 1})).unwrap();
        tx.commit().await.unwrap();

        let mut tx = uow.begin().await.unwrap();
        let err = tx.insert("sku:ABC", json!({"qty": 2})).unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation(_)));
    }
}
