//! Entity store interface: checkpointed CRUD with rollback.
//!
//! User indexing functions mutate entities through this trait. Every write
//! is bound to the checkpoint of the task performing it, so the store keeps
//! a version history per row and can restore any earlier checkpoint via
//! [`EntityStore::revert`] — the scheduler's tool for reorg rewinds and
//! failed-task retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use chainflow_core::checkpoint::Checkpoint;

use crate::EngineError;

/// Checkpoint-versioned entity CRUD.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Latest value of a row, if it exists.
    async fn find_unique(&self, table: &str, id: &str) -> Result<Option<Value>, EngineError>;

    /// All live rows of a table as `(id, value)` pairs, ascending by id.
    async fn find_many(&self, table: &str) -> Result<Vec<(String, Value)>, EngineError>;

    /// Insert a new row. Fails if the row already exists.
    async fn create(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError>;

    async fn create_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError>;

    /// Merge `data` into an existing row. Fails if the row does not exist.
    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError>;

    async fn update_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError>;

    /// Create the row or merge into it if it already exists.
    async fn upsert(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError>;

    /// Remove a row. Returns whether it existed.
    async fn delete(
        &self,
        table: &str,
        id: &str,
        checkpoint: Checkpoint,
    ) -> Result<bool, EngineError>;

    /// Restore the store to the state it had when every write with
    /// checkpoint <= `checkpoint` was applied and nothing newer existed.
    async fn revert(&self, checkpoint: Checkpoint) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
struct Version {
    checkpoint: Checkpoint,
    /// `None` marks a deletion.
    data: Option<Value>,
}

type Table = BTreeMap<String, Vec<Version>>;

/// In-memory versioned entity store, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryEntityStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut HashMap<String, Table>) -> T) -> T {
        let mut tables = self.tables.lock().expect("entity store lock poisoned");
        f(&mut tables)
    }
}

fn latest(versions: &[Version]) -> Option<&Value> {
    versions.last().and_then(|v| v.data.as_ref())
}

fn merge(base: Option<&Value>, patch: &Value) -> Value {
    match (base, patch) {
        (Some(Value::Object(base)), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (key, value) in patch {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_unique(&self, table: &str, id: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.with_tables(|tables| {
            tables
                .get(table)
                .and_then(|t| t.get(id))
                .and_then(|versions| latest(versions).cloned())
        }))
    }

    async fn find_many(&self, table: &str) -> Result<Vec<(String, Value)>, EngineError> {
        Ok(self.with_tables(|tables| {
            tables
                .get(table)
                .map(|t| {
                    t.iter()
                        .filter_map(|(id, versions)| {
                            latest(versions).map(|v| (id.clone(), v.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn create(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.with_tables(|tables| {
            let versions = tables
                .entry(table.to_string())
                .or_default()
                .entry(id.to_string())
                .or_default();
            if latest(versions).is_some() {
                return Err(EngineError::Entity(format!(
                    "create: row '{id}' already exists in '{table}'"
                )));
            }
            versions.push(Version {
                checkpoint,
                data: Some(data),
            });
            Ok(())
        })
    }

    async fn create_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        for (id, data) in rows {
            self.create(table, id, data.clone(), checkpoint).await?;
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.with_tables(|tables| {
            let versions = tables
                .entry(table.to_string())
                .or_default()
                .entry(id.to_string())
                .or_default();
            let Some(current) = latest(versions).cloned() else {
                return Err(EngineError::Entity(format!(
                    "update: row '{id}' does not exist in '{table}'"
                )));
            };
            let merged = merge(Some(&current), &data);
            versions.push(Version {
                checkpoint,
                data: Some(merged),
            });
            Ok(())
        })
    }

    async fn update_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        for (id, data) in rows {
            self.update(table, id, data.clone(), checkpoint).await?;
        }
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.with_tables(|tables| {
            let versions = tables
                .entry(table.to_string())
                .or_default()
                .entry(id.to_string())
                .or_default();
            let merged = merge(latest(versions), &data);
            versions.push(Version {
                checkpoint,
                data: Some(merged),
            });
            Ok(())
        })
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        checkpoint: Checkpoint,
    ) -> Result<bool, EngineError> {
        self.with_tables(|tables| {
            let versions = tables
                .entry(table.to_string())
                .or_default()
                .entry(id.to_string())
                .or_default();
            let existed = latest(versions).is_some();
            if existed {
                versions.push(Version {
                    checkpoint,
                    data: None,
                });
            }
            Ok(existed)
        })
    }

    async fn revert(&self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        self.with_tables(|tables| {
            for table in tables.values_mut() {
                for versions in table.values_mut() {
                    versions.retain(|v| v.checkpoint <= checkpoint);
                }
                table.retain(|_, versions| !versions.is_empty());
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cp(block: u64) -> Checkpoint {
        Checkpoint::of_log(block * 12, 1, block, 0)
    }

    #[tokio::test]
    async fn create_and_find() {
        let store = MemoryEntityStore::new();
        store
            .create("accounts", "alice", json!({"balance": "100"}), cp(1))
            .await
            .unwrap();

        let row = store.find_unique("accounts", "alice").await.unwrap();
        assert_eq!(row, Some(json!({"balance": "100"})));
        assert!(store.find_unique("accounts", "bob").await.unwrap().is_none());

        // Duplicate create is an error.
        let err = store
            .create("accounts", "alice", json!({}), cp(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Entity(_)));
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = MemoryEntityStore::new();
        store
            .create("accounts", "alice", json!({"balance": "100", "nonce": 0}), cp(1))
            .await
            .unwrap();
        store
            .update("accounts", "alice", json!({"balance": "150"}), cp(2))
            .await
            .unwrap();

        let row = store.find_unique("accounts", "alice").await.unwrap().unwrap();
        assert_eq!(row, json!({"balance": "150", "nonce": 0}));

        let err = store
            .update("accounts", "ghost", json!({}), cp(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Entity(_)));
    }

    #[tokio::test]
    async fn upsert_and_delete() {
        let store = MemoryEntityStore::new();
        store
            .upsert("accounts", "alice", json!({"balance": "1"}), cp(1))
            .await
            .unwrap();
        store
            .upsert("accounts", "alice", json!({"nonce": 5}), cp(2))
            .await
            .unwrap();
        assert_eq!(
            store.find_unique("accounts", "alice").await.unwrap(),
            Some(json!({"balance": "1", "nonce": 5}))
        );

        assert!(store.delete("accounts", "alice", cp(3)).await.unwrap());
        assert!(store.find_unique("accounts", "alice").await.unwrap().is_none());
        assert!(!store.delete("accounts", "alice", cp(4)).await.unwrap());
    }

    #[tokio::test]
    async fn revert_restores_earlier_checkpoint() {
        let store = MemoryEntityStore::new();
        store
            .create("accounts", "alice", json!({"balance": "100"}), cp(1))
            .await
            .unwrap();
        store
            .update("accounts", "alice", json!({"balance": "200"}), cp(5))
            .await
            .unwrap();
        store
            .create("accounts", "bob", json!({"balance": "7"}), cp(6))
            .await
            .unwrap();
        store.delete("accounts", "alice", cp(8)).await.unwrap();

        store.revert(cp(5)).await.unwrap();

        // alice is back at her checkpoint-5 value; bob never happened.
        assert_eq!(
            store.find_unique("accounts", "alice").await.unwrap(),
            Some(json!({"balance": "200"}))
        );
        assert!(store.find_unique("accounts", "bob").await.unwrap().is_none());

        store.revert(Checkpoint::ZERO).await.unwrap();
        assert!(store.find_many("accounts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_many_lists_live_rows() {
        let store = MemoryEntityStore::new();
        store
            .create("pools", "0xa", json!({"fee": 500}), cp(1))
            .await
            .unwrap();
        store
            .create("pools", "0xb", json!({"fee": 3000}), cp(2))
            .await
            .unwrap();
        store.delete("pools", "0xa", cp(3)).await.unwrap();

        let rows = store.find_many("pools").await.unwrap();
        assert_eq!(rows, vec![("0xb".to_string(), json!({"fee": 3000}))]);
    }
}
