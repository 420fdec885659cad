//! Scheduler integration tests against an in-memory sync store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::U256;
use async_trait::async_trait;
use serde_json::{json, Value};

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::event::AbiEvent;
use chainflow_core::filter::LogFilterCriteria;
use chainflow_core::interval::Interval;
use chainflow_core::types::{Block, Log, Transaction};
use chainflow_engine::context::IndexingContext;
use chainflow_engine::entity::{EntityStore, MemoryEntityStore};
use chainflow_engine::registry::{
    EventSource, FunctionError, FunctionRegistry, IndexingFunction, SetupFunction, TableAccess,
};
use chainflow_engine::scheduler::{IndexingScheduler, LogEventTask, SchedulerEvent};
use chainflow_engine::{EngineConfig, EngineError, RpcTransport};
use chainflow_store::{SqliteSyncStore, SyncStore};

const TRANSFER_DECL: &str =
    "Transfer(address indexed from, address indexed to, uint256 value)";

fn transfer_event(contract: &str) -> AbiEvent {
    AbiEvent::parse(contract, TRANSFER_DECL).unwrap()
}

fn block(number: u64) -> Block {
    Block {
        number,
        hash: format!("0xblock{number}"),
        parent_hash: format!("0xblock{}", number.saturating_sub(1)),
        timestamp: number,
        miner: "0xminer".into(),
        gas_limit: U256::from(30_000_000u64),
        gas_used: U256::from(1_000_000u64),
        base_fee_per_gas: None,
        size: U256::from(1_000u64),
        total_difficulty: None,
        state_root: "0x".into(),
        transactions_root: "0x".into(),
        receipts_root: "0x".into(),
        logs_bloom: "0x".into(),
        extra_data: "0x".into(),
    }
}

fn tx_for(block: &Block) -> Transaction {
    Transaction {
        hash: format!("0xtx{}", block.number),
        block_hash: block.hash.clone(),
        block_number: block.number,
        transaction_index: 0,
        from: "0xsender".into(),
        to: Some("0xrecipient".into()),
        value: U256::ZERO,
        gas: U256::from(21_000u64),
        gas_price: None,
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
        input: "0x".into(),
        nonce: 0,
    }
}

fn transfer_log(abi: &AbiEvent, block: &Block, log_index: u32, address: &str, value: u64) -> Log {
    let pad_address = |byte: &str| format!("0x{}{}", "00".repeat(12), byte.repeat(20));
    Log {
        address: address.into(),
        block_hash: block.hash.clone(),
        block_number: block.number,
        log_index,
        transaction_hash: format!("0xtx{}", block.number),
        transaction_index: 0,
        data: format!("0x{value:064x}"),
        topics: vec![abi.selector.clone(), pad_address("11"), pad_address("22")],
    }
}

async fn seed_transfers(
    store: &SqliteSyncStore,
    abi: &AbiEvent,
    address: &str,
    events: &[(u64, u32, u64)], // (block_number, log_index, value)
) {
    let filter = LogFilterCriteria::address(address);
    let mut by_block: HashMap<u64, Vec<(u32, u64)>> = HashMap::new();
    for (number, index, value) in events {
        by_block.entry(*number).or_default().push((*index, *value));
    }
    for (number, logs) in by_block {
        let b = block(number);
        let t = tx_for(&b);
        let logs: Vec<Log> = logs
            .into_iter()
            .map(|(index, value)| transfer_log(abi, &b, index, address, value))
            .collect();
        store
            .insert_log_filter_interval(1, &filter, &b, &[t], &logs, Interval::new(number, number))
            .await
            .unwrap();
    }
}

fn source_for(address: &str) -> EventSource {
    EventSource::LogFilter {
        name: "test".into(),
        network: "mainnet".into(),
        chain_id: 1,
        criteria: LogFilterCriteria::address(address),
        start_block: 0,
        end_block: None,
    }
}

struct NoRpc;

#[async_trait]
impl RpcTransport for NoRpc {
    async fn request(
        &self,
        _chain_id: u64,
        _method: &str,
        _params: Value,
    ) -> Result<Value, EngineError> {
        Err(EngineError::Fatal("no rpc in tests".into()))
    }
}

/// Records every invocation; optionally writes a row per event.
struct Recorder {
    label: String,
    calls: Arc<Mutex<Vec<(String, Checkpoint)>>>,
    write_table: Option<String>,
    active: Arc<AtomicU32>,
    max_active: Arc<AtomicU32>,
}

impl Recorder {
    fn new(label: &str, calls: Arc<Mutex<Vec<(String, Checkpoint)>>>) -> Self {
        Self {
            label: label.into(),
            calls,
            write_table: None,
            active: Arc::new(AtomicU32::new(0)),
            max_active: Arc::new(AtomicU32::new(0)),
        }
    }

    fn writing(mut self, table: &str) -> Self {
        self.write_table = Some(table.into());
        self
    }
}

#[async_trait]
impl IndexingFunction for Recorder {
    async fn invoke(
        &self,
        ctx: &IndexingContext,
        event: &LogEventTask,
    ) -> Result<(), FunctionError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        // Let concurrent siblings overlap if the scheduler permits it.
        tokio::task::yield_now().await;

        if let Some(table) = &self.write_table {
            ctx.db
                .upsert(
                    table,
                    &event.checkpoint.to_string(),
                    json!({"value": event.params["value"]}),
                )
                .await
                .map_err(|e| FunctionError::retryable(e.to_string()))?;
        }
        self.calls
            .lock()
            .unwrap()
            .push((self.label.clone(), event.checkpoint));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SetupRecorder {
    calls: Arc<Mutex<Vec<(String, Checkpoint)>>>,
}

#[async_trait]
impl SetupFunction for SetupRecorder {
    async fn invoke(&self, _ctx: &IndexingContext) -> Result<(), FunctionError> {
        self.calls
            .lock()
            .unwrap()
            .push(("setup".into(), Checkpoint::ZERO));
        Ok(())
    }
}

/// Counts `revert` calls, delegating everything to a memory store.
struct CountingEntityStore {
    inner: MemoryEntityStore,
    reverts: AtomicU32,
}

#[async_trait]
impl EntityStore for CountingEntityStore {
    async fn find_unique(&self, table: &str, id: &str) -> Result<Option<Value>, EngineError> {
        self.inner.find_unique(table, id).await
    }
    async fn find_many(&self, table: &str) -> Result<Vec<(String, Value)>, EngineError> {
        self.inner.find_many(table).await
    }
    async fn create(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.inner.create(table, id, data, checkpoint).await
    }
    async fn create_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.inner.create_many(table, rows, checkpoint).await
    }
    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.inner.update(table, id, data, checkpoint).await
    }
    async fn update_many(
        &self,
        table: &str,
        rows: &[(String, Value)],
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.inner.update_many(table, rows, checkpoint).await
    }
    async fn upsert(
        &self,
        table: &str,
        id: &str,
        data: Value,
        checkpoint: Checkpoint,
    ) -> Result<(), EngineError> {
        self.inner.upsert(table, id, data, checkpoint).await
    }
    async fn delete(
        &self,
        table: &str,
        id: &str,
        checkpoint: Checkpoint,
    ) -> Result<bool, EngineError> {
        self.inner.delete(table, id, checkpoint).await
    }
    async fn revert(&self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        self.inner.revert(checkpoint).await
    }
}

struct Harness {
    store: Arc<SqliteSyncStore>,
    entities: Arc<CountingEntityStore>,
    scheduler: IndexingScheduler,
    events: tokio::sync::mpsc::UnboundedReceiver<SchedulerEvent>,
    calls: Arc<Mutex<Vec<(String, Checkpoint)>>>,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
        let entities = Arc::new(CountingEntityStore {
            inner: MemoryEntityStore::new(),
            reverts: AtomicU32::new(0),
        });
        let (scheduler, events) = IndexingScheduler::new(
            store.clone(),
            entities.clone(),
            Arc::new(NoRpc),
            HashMap::new(),
            EngineConfig::default(),
        );
        Self {
            store,
            entities,
            scheduler,
            events,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn call_log(&self) -> Vec<(String, Checkpoint)> {
        self.calls.lock().unwrap().clone()
    }
}

fn target(block_number: u64) -> Checkpoint {
    Checkpoint::of_block(block_number, 1, block_number)
}

#[tokio::test]
async fn processes_events_in_checkpoint_order() {
    let mut harness = Harness::new().await;
    let abi = transfer_event("Token");
    seed_transfers(&harness.store, &abi, "0xaaaa", &[(10, 0, 1), (10, 1, 2), (20, 0, 3)]).await;

    let registry = FunctionRegistry::builder()
        .log_function(
            "fn-transfer",
            abi,
            Arc::new(Recorder::new("Token:Transfer", harness.calls.clone())),
            vec![source_for("0xaaaa")],
            TableAccess::new(["accounts"], ["accounts"]),
        )
        .build()
        .unwrap();

    harness.scheduler.reset(Arc::new(registry)).await.unwrap();
    harness.scheduler.handle_checkpoint(target(20)).await.unwrap();

    let calls = harness.call_log();
    let checkpoints: Vec<Checkpoint> = calls.iter().map(|(_, c)| *c).collect();
    assert_eq!(
        checkpoints,
        vec![
            Checkpoint::of_log(10, 1, 10, 0),
            Checkpoint::of_log(10, 1, 10, 1),
            Checkpoint::of_log(20, 1, 20, 0),
        ]
    );

    let events = harness.drain_events();
    assert!(events.contains(&SchedulerEvent::EventsProcessed {
        to_checkpoint: target(20)
    }));
}

#[tokio::test]
async fn self_dependent_function_runs_serially() {
    let mut harness = Harness::new().await;
    let abi = transfer_event("Token");
    seed_transfers(
        &harness.store,
        &abi,
        "0xaaaa",
        &[(10, 0, 1), (10, 1, 2), (10, 2, 3), (11, 0, 4)],
    )
    .await;

    let recorder = Recorder::new("Token:Transfer", harness.calls.clone()).writing("accounts");
    let max_active = recorder.max_active.clone();
    let registry = FunctionRegistry::builder()
        .log_function(
            "fn-transfer",
            abi,
            Arc::new(recorder),
            vec![source_for("0xaaaa")],
            // Reads and writes the same table: self-dependent.
            TableAccess::new(["accounts"], ["accounts"]),
        )
        .build()
        .unwrap();

    harness.scheduler.reset(Arc::new(registry)).await.unwrap();
    harness.scheduler.handle_checkpoint(target(11)).await.unwrap();

    assert_eq!(harness.call_log().len(), 4);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    let _ = harness.drain_events();
}

#[tokio::test]
async fn dependent_function_waits_for_parent() {
    let mut harness = Harness::new().await;
    let parent_abi = transfer_event("TokenA");
    let child_abi = transfer_event("TokenB");
    // Parent has one event at checkpoint 50; child at 30, 45, 60.
    seed_transfers(&harness.store, &parent_abi, "0xaaaa", &[(50, 0, 1)]).await;
    seed_transfers(
        &harness.store,
        &child_abi,
        "0xbbbb",
        &[(30, 0, 1), (45, 0, 2), (60, 0, 3)],
    )
    .await;

    let registry = FunctionRegistry::builder()
        .log_function(
            "fn-parent",
            parent_abi,
            Arc::new(Recorder::new("A", harness.calls.clone()).writing("t")),
            vec![source_for("0xaaaa")],
            TableAccess::new(Vec::<String>::new(), ["t"]),
        )
        .log_function(
            "fn-child",
            child_abi,
            Arc::new(Recorder::new("B", harness.calls.clone())),
            vec![source_for("0xbbbb")],
            TableAccess::new(["t"], ["u"]),
        )
        .build()
        .unwrap();

    harness.scheduler.reset(Arc::new(registry)).await.unwrap();
    harness.scheduler.handle_checkpoint(target(60)).await.unwrap();

    let calls = harness.call_log();
    assert_eq!(calls.len(), 4);
    // The child's task past the parent's frontier runs only after the
    // parent's task at 50 completed.
    let position = |label: &str, ts: u64| {
        calls
            .iter()
            .position(|(l, c)| l == label && c.block_timestamp == ts)
            .unwrap()
    };
    assert!(position("B", 60) > position("A", 50));
    assert!(position("B", 30) < position("B", 60));
    assert!(position("B", 45) < position("B", 60));
    let _ = harness.drain_events();
}

#[tokio::test]
async fn reorg_reverts_entities_once_and_rewinds() {
    let mut harness = Harness::new().await;
    let abi_a = transfer_event("TokenA");
    let abi_b = transfer_event("TokenB");
    seed_transfers(&harness.store, &abi_a, "0xaaaa", &[(900, 0, 1), (1000, 5, 2)]).await;
    seed_transfers(&harness.store, &abi_b, "0xbbbb", &[(950, 0, 1), (1000, 6, 2)]).await;

    let registry = Arc::new(
        FunctionRegistry::builder()
            .log_function(
                "fn-a",
                abi_a,
                Arc::new(Recorder::new("A", harness.calls.clone()).writing("ta")),
                vec![source_for("0xaaaa")],
                TableAccess::new(Vec::<String>::new(), ["ta"]),
            )
            .log_function(
                "fn-b",
                abi_b,
                Arc::new(Recorder::new("B", harness.calls.clone()).writing("tb")),
                vec![source_for("0xbbbb")],
                TableAccess::new(Vec::<String>::new(), ["tb"]),
            )
            .build()
            .unwrap(),
    );

    harness.scheduler.reset(registry).await.unwrap();
    harness.scheduler.handle_checkpoint(target(1000)).await.unwrap();
    assert_eq!(harness.call_log().len(), 4);
    assert_eq!(harness.entities.inner.find_many("ta").await.unwrap().len(), 2);

    let safe = Checkpoint::of_log(900, 1, 900, 0);
    harness.scheduler.handle_reorg(safe).await.unwrap();

    // One revert; writes past the safe checkpoint are gone, earlier ones stay.
    assert_eq!(harness.entities.reverts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.entities.inner.find_many("ta").await.unwrap().len(), 1);
    assert!(harness.entities.inner.find_many("tb").await.unwrap().is_empty());

    // A reorg behind everything is a no-op.
    harness.scheduler.handle_reorg(safe).await.unwrap();
    assert_eq!(harness.entities.reverts.load(Ordering::SeqCst), 1);

    // Reprocessing re-runs the rolled-back events.
    harness.scheduler.process_events().await.unwrap();
    assert_eq!(harness.call_log().len(), 7);
    let _ = harness.drain_events();
}

/// Writes a row per event; fails retryably on the first attempt at the
/// designated timestamp, after yielding so round siblings get a chance to
/// commit before the failure lands.
struct FailOnceAt {
    fail_ts: u64,
    fired: AtomicBool,
    table: String,
    invocations: Arc<AtomicU32>,
}

#[async_trait]
impl IndexingFunction for FailOnceAt {
    async fn invoke(
        &self,
        ctx: &IndexingContext,
        event: &LogEventTask,
    ) -> Result<(), FunctionError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if event.checkpoint.block_timestamp == self.fail_ts
            && !self.fired.swap(true, Ordering::SeqCst)
        {
            return Err(FunctionError::retryable("transient"));
        }
        ctx.db
            .upsert(
                &self.table,
                &event.checkpoint.to_string(),
                json!({"ts": event.checkpoint.block_timestamp}),
            )
            .await
            .map_err(|e| FunctionError::retryable(e.to_string()))?;
        Ok(())
    }
}

#[tokio::test]
async fn concurrent_batch_retry_replays_reverted_siblings() {
    let mut harness = Harness::new().await;
    let abi = transfer_event("Token");
    seed_transfers(&harness.store, &abi, "0xaaaa", &[(10, 0, 1), (20, 0, 2), (30, 0, 3)]).await;

    let invocations = Arc::new(AtomicU32::new(0));
    let registry = FunctionRegistry::builder()
        .log_function(
            "fn-batch",
            abi,
            Arc::new(FailOnceAt {
                fail_ts: 10,
                fired: AtomicBool::new(false),
                table: "rows".into(),
                invocations: invocations.clone(),
            }),
            vec![source_for("0xaaaa")],
            // No reads: the whole buffer dispatches concurrently.
            TableAccess::new(Vec::<String>::new(), ["rows"]),
        )
        .build()
        .unwrap();

    harness.scheduler.reset(Arc::new(registry)).await.unwrap();
    harness.scheduler.handle_checkpoint(target(30)).await.unwrap();

    // Round 1 runs all three concurrently and the task at 10 fails after
    // its siblings committed; one rewind, then all three replay.
    assert_eq!(invocations.load(Ordering::SeqCst), 6);
    assert_eq!(harness.entities.reverts.load(Ordering::SeqCst), 1);

    // The higher-checkpoint siblings' rows survive the retry.
    let rows = harness.entities.inner.find_many("rows").await.unwrap();
    let ts: Vec<u64> = rows
        .iter()
        .map(|(_, value)| value["ts"].as_u64().unwrap())
        .collect();
    assert_eq!(ts, vec![10, 20, 30]);
    assert!(harness
        .drain_events()
        .iter()
        .all(|e| !matches!(e, SchedulerEvent::Error { .. })));
}

#[tokio::test]
async fn cross_function_retry_replays_unrelated_writes() {
    let mut harness = Harness::new().await;
    let healthy_abi = transfer_event("TokenA");
    let flaky_abi = transfer_event("TokenB");
    seed_transfers(&harness.store, &healthy_abi, "0xaaaa", &[(50, 0, 1)]).await;
    seed_transfers(&harness.store, &flaky_abi, "0xbbbb", &[(40, 0, 2)]).await;

    let invocations = Arc::new(AtomicU32::new(0));
    let registry = FunctionRegistry::builder()
        .log_function(
            "fn-healthy",
            healthy_abi,
            Arc::new(Recorder::new("A", harness.calls.clone()).writing("ta")),
            vec![source_for("0xaaaa")],
            TableAccess::new(Vec::<String>::new(), ["ta"]),
        )
        .log_function(
            "fn-flaky",
            flaky_abi,
            Arc::new(FailOnceAt {
                fail_ts: 40,
                fired: AtomicBool::new(false),
                table: "tb".into(),
                invocations: invocations.clone(),
            }),
            vec![source_for("0xbbbb")],
            TableAccess::new(Vec::<String>::new(), ["tb"]),
        )
        .build()
        .unwrap();

    harness.scheduler.reset(Arc::new(registry)).await.unwrap();
    harness.scheduler.handle_checkpoint(target(50)).await.unwrap();

    // The two functions share no tables, but the revert below checkpoint 40
    // still discards the healthy function's commit at 50. The rewind clamps
    // the healthy function too, so its task is re-delivered and the write
    // is back afterwards.
    assert_eq!(harness.entities.reverts.load(Ordering::SeqCst), 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    let healthy_runs = harness
        .call_log()
        .iter()
        .filter(|(label, _)| label == "A")
        .count();
    assert_eq!(healthy_runs, 2);
    assert_eq!(harness.entities.inner.find_many("ta").await.unwrap().len(), 1);
    assert_eq!(harness.entities.inner.find_many("tb").await.unwrap().len(), 1);
    assert!(harness
        .drain_events()
        .iter()
        .all(|e| !matches!(e, SchedulerEvent::Error { .. })));
}

struct FlakyHandler {
    failures_left: AtomicU32,
    attempts: Arc<AtomicU32>,
    retryable: bool,
}

#[async_trait]
impl IndexingFunction for FlakyHandler {
    async fn invoke(
        &self,
        ctx: &IndexingContext,
        event: &LogEventTask,
    ) -> Result<(), FunctionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        // Leave a partial write behind before failing.
        ctx.db
            .upsert("partial", &event.checkpoint.to_string(), json!({"x": 1}))
            .await
            .map_err(|e| FunctionError::retryable(e.to_string()))?;
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            if self.retryable {
                Err(FunctionError::retryable("transient"))
            } else {
                Err(FunctionError::non_retryable("poison"))
            }
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn failed_task_rewinds_and_retries() {
    let mut harness = Harness::new().await;
    let abi = transfer_event("Token");
    seed_transfers(&harness.store, &abi, "0xaaaa", &[(10, 0, 1)]).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let registry = FunctionRegistry::builder()
        .log_function(
            "fn-flaky",
            abi,
            Arc::new(FlakyHandler {
                failures_left: AtomicU32::new(2),
                attempts: attempts.clone(),
                retryable: true,
            }),
            vec![source_for("0xaaaa")],
            TableAccess::default(),
        )
        .build()
        .unwrap();

    harness.scheduler.reset(Arc::new(registry)).await.unwrap();
    harness.scheduler.handle_checkpoint(target(10)).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // Two failures, two rewinds.
    assert_eq!(harness.entities.reverts.load(Ordering::SeqCst), 2);
    assert!(harness
        .drain_events()
        .iter()
        .all(|e| !matches!(e, SchedulerEvent::Error { .. })));
}

#[tokio::test]
async fn non_retryable_failure_halts_scheduler() {
    let mut harness = Harness::new().await;
    let abi = transfer_event("Token");
    seed_transfers(&harness.store, &abi, "0xaaaa", &[(10, 0, 1), (20, 0, 2)]).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let registry = FunctionRegistry::builder()
        .log_function(
            "fn-poison",
            abi,
            Arc::new(FlakyHandler {
                failures_left: AtomicU32::new(u32::MAX),
                attempts: attempts.clone(),
                retryable: false,
            }),
            vec![source_for("0xaaaa")],
            // Self-dependent: one task at a time, so the poison task is the
            // only one that ever runs.
            TableAccess::new(["t"], ["t"]),
        )
        .build()
        .unwrap();

    harness.scheduler.reset(Arc::new(registry)).await.unwrap();
    harness.scheduler.handle_checkpoint(target(20)).await.unwrap();

    // No retries for the poisoned task.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let errors: Vec<SchedulerEvent> = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);

    // Paused: further checkpoints do nothing.
    harness.scheduler.handle_checkpoint(target(30)).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resumes_from_persisted_metadata() {
    let mut harness = Harness::new().await;
    let abi = transfer_event("Token");
    seed_transfers(&harness.store, &abi, "0xaaaa", &[(10, 0, 1), (20, 0, 2)]).await;

    let build_registry = |calls: Arc<Mutex<Vec<(String, Checkpoint)>>>| {
        Arc::new(
            FunctionRegistry::builder()
                .log_function(
                    "fn-transfer",
                    transfer_event("Token"),
                    Arc::new(Recorder::new("Token:Transfer", calls)),
                    vec![source_for("0xaaaa")],
                    TableAccess::default(),
                )
                .build()
                .unwrap(),
        )
    };

    harness.scheduler.reset(build_registry(harness.calls.clone())).await.unwrap();
    harness
        .scheduler
        .handle_finality_checkpoint(target(20))
        .await;
    harness.scheduler.handle_checkpoint(target(20)).await.unwrap();
    assert_eq!(harness.call_log().len(), 2);
    harness.scheduler.kill().await.unwrap();

    // A fresh scheduler over the same store skips completed work.
    let second_calls: Arc<Mutex<Vec<(String, Checkpoint)>>> = Arc::new(Mutex::new(Vec::new()));
    let (scheduler, _events) = IndexingScheduler::new(
        harness.store.clone(),
        harness.entities.clone(),
        Arc::new(NoRpc),
        HashMap::new(),
        EngineConfig::default(),
    );
    scheduler.reset(build_registry(second_calls.clone())).await.unwrap();
    scheduler.handle_checkpoint(target(20)).await.unwrap();
    assert!(second_calls.lock().unwrap().is_empty());
    let _ = harness.drain_events();
}

#[tokio::test]
async fn setup_function_runs_before_events_and_only_once() {
    let mut harness = Harness::new().await;
    let abi = transfer_event("Token");
    seed_transfers(&harness.store, &abi, "0xaaaa", &[(10, 0, 1)]).await;

    let build_registry = |calls: Arc<Mutex<Vec<(String, Checkpoint)>>>| {
        Arc::new(
            FunctionRegistry::builder()
                .log_function(
                    "fn-transfer",
                    transfer_event("Token"),
                    Arc::new(Recorder::new("Token:Transfer", calls.clone())),
                    vec![source_for("0xaaaa")],
                    TableAccess::default(),
                )
                .setup_function("fn-setup", "Token", Arc::new(SetupRecorder { calls }))
                .build()
                .unwrap(),
        )
    };

    harness.scheduler.reset(build_registry(harness.calls.clone())).await.unwrap();
    harness
        .scheduler
        .handle_finality_checkpoint(target(10))
        .await;
    harness.scheduler.handle_checkpoint(target(10)).await.unwrap();

    let calls = harness.call_log();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "setup");
    assert_eq!(calls[1].0, "Token:Transfer");

    // Persist the sentinel, then reset a fresh scheduler: setup is skipped.
    harness.scheduler.flush().await.unwrap();
    let second_calls: Arc<Mutex<Vec<(String, Checkpoint)>>> = Arc::new(Mutex::new(Vec::new()));
    let (scheduler, _events) = IndexingScheduler::new(
        harness.store.clone(),
        harness.entities.clone(),
        Arc::new(NoRpc),
        HashMap::new(),
        EngineConfig::default(),
    );
    scheduler.reset(build_registry(second_calls.clone())).await.unwrap();
    scheduler.process_events().await.unwrap();
    assert!(second_calls
        .lock()
        .unwrap()
        .iter()
        .all(|(label, _)| label != "setup"));
    let _ = harness.drain_events();
}
