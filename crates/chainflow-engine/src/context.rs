//! The context handed to user indexing functions.
//!
//! Shape: `{ network, client, db, contracts }`. The client is a read-only
//! RPC whose responses are cached through the sync store's
//! `rpc_request_results` table, keyed `(chain_id, block_number, request)` —
//! replays of the same task hit the cache and never touch the network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::trace;

use chainflow_core::checkpoint::Checkpoint;
use chainflow_store::SyncStore;

use crate::entity::EntityStore;
use crate::EngineError;

/// The network a task's event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: String,
    pub chain_id: u64,
}

/// Read-only JSON-RPC transport supplied by the host.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, chain_id: u64, method: &str, params: Value)
        -> Result<Value, EngineError>;
}

/// RPC client pinned to a task's block, with read-through caching.
#[derive(Clone)]
pub struct CachedRpcClient {
    chain_id: u64,
    block_number: u64,
    store: Arc<dyn SyncStore>,
    transport: Arc<dyn RpcTransport>,
}

impl CachedRpcClient {
    pub fn new(
        chain_id: u64,
        block_number: u64,
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        Self {
            chain_id,
            block_number,
            store,
            transport,
        }
    }

    /// Issue a read, consulting the request cache first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let request = serde_json::to_string(&json!({ "method": method, "params": params }))
            .map_err(|e| EngineError::Fatal(format!("unserializable rpc request: {e}")))?;

        if let Some(cached) = self
            .store
            .get_rpc_request_result(self.chain_id, self.block_number, &request)
            .await?
        {
            trace!(method, block = self.block_number, "rpc cache hit");
            return serde_json::from_str(&cached)
                .map_err(|e| EngineError::Fatal(format!("corrupt cached rpc result: {e}")));
        }

        let result = self.transport.request(self.chain_id, method, params).await?;
        self.store
            .insert_rpc_request_result(
                self.chain_id,
                self.block_number,
                &request,
                &result.to_string(),
            )
            .await?;
        Ok(result)
    }
}

/// A named contract binding exposed to user code.
#[derive(Debug, Clone)]
pub struct ContractBinding {
    pub name: String,
    pub address: String,
}

/// Entity CRUD pre-bound to the running task's checkpoint.
#[derive(Clone)]
pub struct EntityDb {
    store: Arc<dyn EntityStore>,
    checkpoint: Checkpoint,
}

impl EntityDb {
    pub fn new(store: Arc<dyn EntityStore>, checkpoint: Checkpoint) -> Self {
        Self { store, checkpoint }
    }

    pub async fn find_unique(&self, table: &str, id: &str) -> Result<Option<Value>, EngineError> {
        self.store.find_unique(table, id).await
    }

    pub async fn find_many(&self, table: &str) -> Result<Vec<(String, Value)>, EngineError> {
        self.store.find_many(table).await
    }

    pub async fn create(&self, table: &str, id: &str, data: Value) -> Result<(), EngineError> {
        self.store.create(table, id, data, self.checkpoint).await
    }

    pub async fn create_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
    ) -> Result<(), EngineError> {
        self.store.create_many(table, rows, self.checkpoint).await
    }

    pub async fn update(&self, table: &str, id: &str, data: Value) -> Result<(), EngineError> {
        self.store.update(table, id, data, self.checkpoint).await
    }

    pub async fn update_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
    ) -> Result<(), EngineError> {
        self.store.update_many(table, rows, self.checkpoint).await
    }

    pub async fn upsert(&self, table: &str, id: &str, data: Value) -> Result<(), EngineError> {
        self.store.upsert(table, id, data, self.checkpoint).await
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<bool, EngineError> {
        self.store.delete(table, id, self.checkpoint).await
    }
}

/// Everything a user indexing function can touch.
#[derive(Clone)]
pub struct IndexingContext {
    pub network: NetworkInfo,
    pub client: CachedRpcClient,
    pub db: EntityDb,
    pub contracts: HashMap<String, ContractBinding>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MemoryEntityStore;
    use chainflow_store::SqliteSyncStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTransport(AtomicU32);

    #[async_trait]
    impl RpcTransport for CountingTransport {
        async fn request(
            &self,
            _chain_id: u64,
            _method: &str,
            _params: Value,
        ) -> Result<Value, EngineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!("0xbalance"))
        }
    }

    #[tokio::test]
    async fn rpc_reads_are_cached_per_block() {
        let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
        let transport = Arc::new(CountingTransport(AtomicU32::new(0)));

        let client = CachedRpcClient::new(1, 100, store.clone(), transport.clone());
        let first = client
            .request("eth_getBalance", json!(["0xaaaa", "0x64"]))
            .await
            .unwrap();
        let second = client
            .request("eth_getBalance", json!(["0xaaaa", "0x64"]))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);

        // A different block is a different cache key.
        let other = CachedRpcClient::new(1, 101, store, transport.clone());
        other
            .request("eth_getBalance", json!(["0xaaaa", "0x64"]))
            .await
            .unwrap();
        assert_eq!(transport.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn entity_db_binds_checkpoint() {
        let entities = Arc::new(MemoryEntityStore::new());
        let checkpoint = Checkpoint::of_log(10, 1, 100, 0);
        let db = EntityDb::new(entities.clone(), checkpoint);

        db.create("accounts", "alice", json!({"balance": "1"}))
            .await
            .unwrap();
        assert!(db.find_unique("accounts", "alice").await.unwrap().is_some());

        // Reverting to just before the bound checkpoint undoes the write.
        entities
            .revert(Checkpoint::of_log(9, 1, 99, 0))
            .await
            .unwrap();
        assert!(db.find_unique("accounts", "alice").await.unwrap().is_none());
    }
}
