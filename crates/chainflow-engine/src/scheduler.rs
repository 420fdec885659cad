//! Indexing scheduler.
//!
//! Owns one state object per indexing function, loads decoded events from
//! the sync store in budgeted batches, and dispatches them to a bounded
//! worker pool under the declared read/write dependency constraints:
//!
//! | case | parents | self-dependent | action |
//! |------|---------|----------------|--------|
//! | 1    | none    | yes            | one task at a time |
//! | 2    | none    | no             | everything buffered |
//! | 3    | some    | yes            | one task, gated on parents |
//! | 4    | some    | no             | prefix up to min(parent loaded-from) |
//!
//! A task may run only once every parent write strictly before its
//! checkpoint has executed; a self-dependent function runs serially within
//! itself to preserve read-your-own-writes. Dispatch proceeds in rounds:
//! eligibility is evaluated against post-completion state, so tasks running
//! concurrently within a round are mutually unordered.
//!
//! Failure handling: workers attempt a task once. Retryable failures are
//! deferred until the whole round has drained, then the entity store is
//! reverted once to just below the lowest failing checkpoint and every
//! function is clamped there, exactly like a reorg rewind. Anything whose
//! writes the revert discarded (round siblings included) is reloaded and
//! re-executed; per-task attempt counts live in scheduler state so they
//! survive the reload.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::types::{Block, Log, Transaction};
use chainflow_store::{
    FactoryQuery, FunctionMetadata, GetLogEventsArgs, LogFilterQuery, SyncStore,
};

use crate::config::EngineConfig;
use crate::context::{CachedRpcClient, ContractBinding, EntityDb, IndexingContext, NetworkInfo, RpcTransport};
use crate::entity::EntityStore;
use crate::lock::CancelableMutex;
use crate::metrics::EngineMetrics;
use crate::registry::{EventSource, FunctionError, FunctionRegistry, RegisteredFunction};
use crate::EngineError;

/// Events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Every function has processed (or has nothing to process) up to this
    /// checkpoint. Monotone across emissions.
    EventsProcessed { to_checkpoint: Checkpoint },
    /// A task failed terminally; the scheduler is paused.
    Error { function: String, message: String },
}

/// One decoded event awaiting execution.
#[derive(Debug, Clone)]
pub struct LogEventTask {
    pub function_key: String,
    pub network: String,
    pub chain_id: u64,
    pub contract_name: String,
    pub event_name: String,
    /// Decoded event parameters, by name.
    pub params: Value,
    pub log: Log,
    pub block: Block,
    pub transaction: Transaction,
    pub checkpoint: Checkpoint,
    /// Set on the last task of a loaded batch; carries the batch length so
    /// the executor emits the batch progress log exactly once.
    pub events_in_batch: Option<usize>,
}

struct FunctionState {
    function_id: String,
    parents: Vec<String>,
    is_self_dependent: bool,
    tasks_processed_to: Checkpoint,
    tasks_loaded_from: Checkpoint,
    tasks_loaded_to: Checkpoint,
    loaded_tasks: VecDeque<LogEventTask>,
    first_event_checkpoint: Option<Checkpoint>,
    last_event_checkpoint: Option<Checkpoint>,
    event_count: u64,
}

impl FunctionState {
    /// The checkpoint this function is complete through.
    fn state_checkpoint(&self) -> Checkpoint {
        if self.loaded_tasks.is_empty() {
            self.tasks_loaded_to
        } else {
            self.tasks_processed_to
        }
    }

    fn is_fully_loaded(&self, target: Checkpoint) -> bool {
        self.tasks_loaded_to >= self.last_event_checkpoint.unwrap_or(Checkpoint::ZERO)
            && self.tasks_loaded_to >= target
    }
}

struct SetupTaskState {
    key: String,
    function_id: String,
    chain_id: u64,
    network: String,
    start_block: u64,
    checkpoint: Checkpoint,
    done: bool,
}

impl SetupTaskState {
    /// Metadata row id: one sentinel per `(setup function, chain)`.
    fn metadata_id(&self) -> String {
        format!("{}:{}", self.function_id, self.chain_id)
    }
}

#[derive(Default)]
struct SchedulerState {
    registry: Arc<FunctionRegistry>,
    functions: HashMap<String, FunctionState>,
    setup_tasks: Vec<SetupTaskState>,
    /// Highest checkpoint the gateway has released for delivery.
    target_checkpoint: Checkpoint,
    finality_checkpoint: Checkpoint,
    last_emitted_progress: Checkpoint,
    /// Failed attempts per `(function, checkpoint)`. Kept out of the task
    /// objects because a retry rewind reloads tasks from the store.
    retry_attempts: HashMap<(String, Checkpoint), u32>,
}

struct SchedulerInner {
    store: Arc<dyn SyncStore>,
    entity_store: Arc<dyn EntityStore>,
    transport: Arc<dyn RpcTransport>,
    contracts: HashMap<String, ContractBinding>,
    config: EngineConfig,
    state: Mutex<SchedulerState>,
    /// Serializes batch loading and reorg handling; cancelable.
    loading_lock: CancelableMutex,
    /// Serializes whole process_events passes.
    processing_lock: Mutex<()>,
    is_paused: AtomicBool,
    worker_slots: Arc<Semaphore>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    metrics: EngineMetrics,
    yield_counter: AtomicU64,
    flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// The per-function task pipeline.
#[derive(Clone)]
pub struct IndexingScheduler {
    inner: Arc<SchedulerInner>,
}

enum RoundTask {
    Setup {
        index: usize,
        key: String,
        chain_id: u64,
        network: String,
        start_block: u64,
        checkpoint: Checkpoint,
    },
    Log(Box<LogEventTask>),
}

impl RoundTask {
    fn function(&self) -> &str {
        match self {
            Self::Setup { key, .. } => key,
            Self::Log(task) => &task.function_key,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        match self {
            Self::Setup { checkpoint, .. } => *checkpoint,
            Self::Log(task) => task.checkpoint,
        }
    }
}

/// One attempt's outcome, classified for the round-level failure policy.
enum TaskFailure {
    Retryable(String),
    Terminal(String),
}

impl From<FunctionError> for TaskFailure {
    fn from(e: FunctionError) -> Self {
        if e.retryable {
            Self::Retryable(e.reason)
        } else {
            Self::Terminal(e.reason)
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable(reason) | Self::Terminal(reason) => f.write_str(reason),
        }
    }
}

impl IndexingScheduler {
    pub fn new(
        store: Arc<dyn SyncStore>,
        entity_store: Arc<dyn EntityStore>,
        transport: Arc<dyn RpcTransport>,
        contracts: HashMap<String, ContractBinding>,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker_slots = Arc::new(Semaphore::new(config.worker_concurrency));
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                store,
                entity_store,
                transport,
                contracts,
                config,
                state: Mutex::new(SchedulerState::default()),
                loading_lock: CancelableMutex::new(),
                processing_lock: Mutex::new(()),
                is_paused: AtomicBool::new(true),
                worker_slots,
                events_tx,
                metrics: EngineMetrics::default(),
                yield_counter: AtomicU64::new(0),
                flush_task: std::sync::Mutex::new(None),
            }),
        };
        (scheduler, events_rx)
    }

    /// Rebuild all per-function state from a (new) registry, seeding
    /// checkpoints from persisted function metadata. Pending loads are
    /// canceled, in-flight tasks drained, and the periodic flush restarted.
    pub async fn reset(&self, registry: Arc<FunctionRegistry>) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.is_paused.store(true, Ordering::SeqCst);
        inner.loading_lock.cancel();
        self.drain_workers().await;
        inner.loading_lock.clear();
        self.stop_flush_task();

        // Setup tasks first: their per-chain sentinel ids participate in the
        // metadata lookup below.
        let mut setup_tasks = Vec::new();
        for setup in registry.setup_functions() {
            for (chain_id, network, start_block) in registry.contract_chains(&setup.contract_name)
            {
                setup_tasks.push(SetupTaskState {
                    key: setup.key.clone(),
                    function_id: setup.function_id.clone(),
                    chain_id,
                    network,
                    start_block,
                    checkpoint: Checkpoint::of_log(0, chain_id, start_block, 0),
                    done: false,
                });
            }
        }

        let mut ids = registry.function_ids();
        ids.extend(setup_tasks.iter().map(SetupTaskState::metadata_id));
        let metadata: HashMap<String, FunctionMetadata> = inner
            .store
            .get_function_metadata(&ids)
            .await?
            .into_iter()
            .map(|row| (row.function_id.clone(), row))
            .collect();

        for setup in &mut setup_tasks {
            setup.done = metadata.contains_key(&setup.metadata_id());
        }

        let dependencies = registry.dependencies();
        let functions = registry
            .log_functions()
            .map(|function| {
                let deps = dependencies.get(&function.key).cloned().unwrap_or_default();
                let persisted = metadata.get(&function.function_id);
                let seed = persisted
                    .map(|row| row.to_checkpoint)
                    .unwrap_or(Checkpoint::ZERO);
                let state = FunctionState {
                    function_id: function.function_id.clone(),
                    parents: deps.parents,
                    is_self_dependent: deps.is_self_dependent,
                    tasks_processed_to: seed,
                    tasks_loaded_from: seed,
                    tasks_loaded_to: seed,
                    loaded_tasks: VecDeque::new(),
                    first_event_checkpoint: persisted
                        .filter(|row| !row.from_checkpoint.is_zero())
                        .map(|row| row.from_checkpoint),
                    last_event_checkpoint: None,
                    event_count: persisted.map(|row| row.event_count).unwrap_or(0),
                };
                (function.key.clone(), state)
            })
            .collect();

        {
            let mut state = inner.state.lock().await;
            *state = SchedulerState {
                registry,
                functions,
                setup_tasks,
                target_checkpoint: Checkpoint::ZERO,
                finality_checkpoint: Checkpoint::ZERO,
                last_emitted_progress: Checkpoint::ZERO,
                retry_attempts: HashMap::new(),
            };
        }

        inner.metrics.set_has_error(false);
        self.start_flush_task();
        inner.is_paused.store(false, Ordering::SeqCst);
        info!("indexing scheduler reset");
        Ok(())
    }

    /// The gateway's global checkpoint advanced: pull and run what it
    /// released.
    pub async fn handle_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().await;
            state.target_checkpoint = state.target_checkpoint.max(checkpoint);
        }
        self.process_events().await
    }

    pub async fn handle_finality_checkpoint(&self, checkpoint: Checkpoint) {
        let mut state = self.inner.state.lock().await;
        state.finality_checkpoint = state.finality_checkpoint.max(checkpoint);
    }

    /// Rewind after a reorg: one entity store revert, then clamp every
    /// function's checkpoints to the safe point. No-op if nothing processed
    /// past it.
    pub async fn handle_reorg(&self, safe_checkpoint: Checkpoint) -> Result<(), EngineError> {
        let inner = self.inner.clone();
        let result = inner
            .loading_lock
            .run_exclusive(async {
                let mut state = self.inner.state.lock().await;
                let affected = state
                    .functions
                    .values()
                    .any(|f| f.tasks_processed_to > safe_checkpoint);
                if !affected {
                    debug!(safe = %safe_checkpoint, "reorg behind all functions, nothing to do");
                    return Ok(());
                }

                self.inner.entity_store.revert(safe_checkpoint).await?;
                clamp_functions(&mut state.functions, safe_checkpoint);
                // Reorged-away tasks get a fresh attempt budget.
                state
                    .retry_attempts
                    .retain(|(_, checkpoint), _| *checkpoint <= safe_checkpoint);
                warn!(safe = %safe_checkpoint, "rewound indexing state after reorg");
                Ok(())
            })
            .await;
        match result {
            Ok(inner_result) => inner_result,
            Err(e) if e.is_canceled() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Load and dispatch until no function can make progress.
    pub async fn process_events(&self) -> Result<(), EngineError> {
        let _guard = self.inner.processing_lock.lock().await;
        loop {
            if self.inner.is_paused.load(Ordering::SeqCst) {
                break;
            }
            let loaded = self.load_tasks().await?;
            let ran = self.dispatch_round().await?;
            if !loaded && !ran {
                break;
            }
        }
        self.emit_progress().await;
        Ok(())
    }

    /// Persist progress rows so the next run can skip completed work.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let rows = {
            let state = self.inner.state.lock().await;
            let mut rows: Vec<FunctionMetadata> = Vec::new();
            for (key, function) in &state.functions {
                let to_checkpoint = function
                    .state_checkpoint()
                    .min(state.finality_checkpoint);
                if to_checkpoint.is_zero() {
                    continue;
                }
                rows.push(FunctionMetadata {
                    function_id: function.function_id.clone(),
                    function_name: key.clone(),
                    from_checkpoint: function.first_event_checkpoint.unwrap_or(Checkpoint::ZERO),
                    to_checkpoint,
                    event_count: function.event_count,
                });
            }
            for setup in state.setup_tasks.iter().filter(|s| s.done) {
                rows.push(FunctionMetadata {
                    function_id: setup.metadata_id(),
                    function_name: setup.key.clone(),
                    from_checkpoint: setup.checkpoint,
                    to_checkpoint: setup.checkpoint,
                    event_count: 0,
                });
            }
            rows
        };
        if !rows.is_empty() {
            self.inner.store.upsert_function_metadata(&rows).await?;
            debug!(rows = rows.len(), "flushed function metadata");
        }
        Ok(())
    }

    /// Stop everything: pause, cancel pending loads, drop buffered tasks,
    /// stop the flush timer, drain in-flight work, and flush once more.
    pub async fn kill(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.is_paused.store(true, Ordering::SeqCst);
        inner.loading_lock.cancel();
        self.stop_flush_task();
        self.drain_workers().await;
        {
            let mut state = inner.state.lock().await;
            for function in state.functions.values_mut() {
                function.loaded_tasks.clear();
            }
        }
        self.flush().await?;
        info!("indexing scheduler stopped");
        Ok(())
    }

    // ─── Batch loading ───────────────────────────────────────────────────────

    /// Load one budgeted page per function behind the target checkpoint.
    /// Returns whether anything advanced. Cancellation is not an error.
    async fn load_tasks(&self) -> Result<bool, EngineError> {
        let result = self
            .inner
            .loading_lock
            .run_exclusive(self.load_tasks_locked())
            .await;
        match result {
            Ok(loaded) => loaded,
            Err(e) if e.is_canceled() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn load_tasks_locked(&self) -> Result<bool, EngineError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let state = &mut *state;
        let target = state.target_checkpoint;
        let registry = state.registry.clone();
        let mut progressed = false;

        let keys: Vec<String> = state.functions.keys().cloned().collect();
        for key in keys {
            let budget = task_batch_size(&state.functions, target, inner.config.max_batch_size);
            if budget == 0 {
                break;
            }
            let Some(registered) = registry.get(&key) else {
                continue;
            };
            let function = state
                .functions
                .get_mut(&key)
                .ok_or_else(|| EngineError::Fatal(format!("missing state for '{key}'")))?;
            if function.tasks_loaded_to >= target {
                continue;
            }

            let args = build_events_args(
                registered,
                function.tasks_loaded_to,
                target,
                budget,
            );
            let page = inner.store.get_log_events(&args).await?;

            let mut tasks: Vec<LogEventTask> = Vec::with_capacity(page.events.len());
            for event in page.events {
                match registered.abi_event.decode_log(&event.log) {
                    Ok(params) => tasks.push(LogEventTask {
                        function_key: key.clone(),
                        network: network_for_chain(registered, event.chain_id),
                        chain_id: event.chain_id,
                        contract_name: registered.abi_event.contract_name.clone(),
                        event_name: registered.abi_event.event_name.clone(),
                        params,
                        log: event.log,
                        block: event.block,
                        transaction: event.transaction,
                        checkpoint: event.checkpoint,
                        events_in_batch: None,
                    }),
                    Err(e) => {
                        // Selector collisions under indexed-argument filters
                        // produce undecodable payloads; drop them.
                        debug!(function = %key, error = %e, "skipping undecodable event");
                        inner.metrics.record_skipped(&key);
                    }
                }
            }
            let tasks_len = tasks.len();
            if let Some(tail) = tasks.last_mut() {
                tail.events_in_batch = Some(tasks_len);
            }

            let was_empty = function.loaded_tasks.is_empty();
            progressed |= !tasks.is_empty();
            function.loaded_tasks.extend(tasks);

            let loaded_to = if page.has_next_page {
                page.last_checkpoint_in_page.unwrap_or(target)
            } else {
                target
            };
            if loaded_to > function.tasks_loaded_to {
                function.tasks_loaded_to = loaded_to;
                progressed = true;
            }
            if function.loaded_tasks.is_empty() {
                // Nothing buffered: this function holds no one back.
                function.tasks_loaded_from = function.tasks_loaded_to;
            } else if was_empty {
                if let Some(front) = function.loaded_tasks.front() {
                    function.tasks_loaded_from = front.checkpoint;
                }
            }
            if function.first_event_checkpoint.is_none() {
                if let Some(front) = function.loaded_tasks.front() {
                    function.first_event_checkpoint = Some(front.checkpoint);
                }
            }
            if let Some(last) = page.last_checkpoint {
                function.last_event_checkpoint = Some(
                    function
                        .last_event_checkpoint
                        .map_or(last, |existing| existing.max(last)),
                );
            }
        }
        Ok(progressed)
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Run one round of eligible tasks to completion. Eligibility is
    /// re-evaluated next round against the updated state.
    async fn dispatch_round(&self) -> Result<bool, EngineError> {
        let inner = &self.inner;
        let (registry, round) = {
            let mut state = inner.state.lock().await;
            let registry = state.registry.clone();
            let round = collect_round(&mut state);
            (registry, round)
        };
        if round.is_empty() {
            return Ok(false);
        }

        let mut join_set: JoinSet<(RoundTask, Result<(), TaskFailure>)> = JoinSet::new();
        for task in round {
            let scheduler = self.clone();
            let registry = registry.clone();
            join_set.spawn(async move {
                let _permit = scheduler.inner.worker_slots.clone().acquire_owned().await;
                let result = scheduler.run_round_task(&registry, &task).await;
                (task, result)
            });
        }

        // Successes update state as they land; failures wait until the round
        // has fully drained, so a revert can never pull committed sibling
        // writes out from under a task that is still running.
        let mut terminal: Option<(String, String)> = None;
        let mut retryable: Vec<(String, Checkpoint, String)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (task, result) = joined
                .map_err(|e| EngineError::Fatal(format!("worker panicked: {e}")))?;
            match (task, result) {
                (RoundTask::Setup { index, key, checkpoint, .. }, Ok(())) => {
                    let mut state = inner.state.lock().await;
                    if let Some(setup) = state.setup_tasks.get_mut(index) {
                        setup.done = true;
                    }
                    state.retry_attempts.remove(&(key.clone(), checkpoint));
                    info!(function = %key, "setup function complete");
                }
                (RoundTask::Log(task), Ok(())) => {
                    let mut state = inner.state.lock().await;
                    state
                        .retry_attempts
                        .remove(&(task.function_key.clone(), task.checkpoint));
                    if let Some(function) = state.functions.get_mut(&task.function_key) {
                        function.tasks_processed_to =
                            function.tasks_processed_to.max(task.checkpoint);
                        function.tasks_loaded_from = function
                            .loaded_tasks
                            .front()
                            .map(|t| t.checkpoint)
                            .unwrap_or(function.tasks_loaded_to);
                        function.event_count += 1;
                    }
                    if let Some(count) = task.events_in_batch {
                        inner.metrics.record_processed(&task.function_key, count as u64);
                        info!(
                            function = %task.function_key,
                            events = count,
                            to = %task.checkpoint,
                            "processed events"
                        );
                    }
                }
                (task, Err(failure)) => {
                    let function = task.function().to_string();
                    let message = match &task {
                        RoundTask::Log(task) => format!(
                            "{failure}\nevent args: {}",
                            serde_json::to_string_pretty(&task.params)
                                .unwrap_or_else(|_| task.params.to_string())
                        ),
                        RoundTask::Setup { .. } => failure.to_string(),
                    };
                    match failure {
                        TaskFailure::Terminal(_) => {
                            terminal.get_or_insert((function, message));
                        }
                        TaskFailure::Retryable(_) => {
                            retryable.push((function, task.checkpoint(), message));
                        }
                    }
                }
            }
        }

        if let Some((function, message)) = terminal {
            self.terminal_failure(&function, message).await;
            return Ok(true);
        }
        if !retryable.is_empty() {
            self.retry_round_failures(retryable).await?;
        }
        Ok(true)
    }

    /// One attempt of one task. Retry policy lives at the round level.
    async fn run_round_task(
        &self,
        registry: &FunctionRegistry,
        task: &RoundTask,
    ) -> Result<(), TaskFailure> {
        self.maybe_yield().await;
        match task {
            RoundTask::Setup {
                key,
                chain_id,
                network,
                start_block,
                checkpoint,
                ..
            } => {
                let handler = registry
                    .get_setup(key)
                    .ok_or_else(|| TaskFailure::Terminal(format!("no setup function '{key}'")))?
                    .handler
                    .clone();
                let ctx =
                    self.build_context(*chain_id, network.clone(), *start_block, *checkpoint);
                handler.invoke(&ctx).await.map_err(TaskFailure::from)
            }
            RoundTask::Log(task) => {
                let handler = registry
                    .get(&task.function_key)
                    .ok_or_else(|| {
                        TaskFailure::Terminal(format!("no function '{}'", task.function_key))
                    })?
                    .handler
                    .clone();
                let ctx = self.build_context(
                    task.chain_id,
                    task.network.clone(),
                    task.block.number,
                    task.checkpoint,
                );
                handler.invoke(&ctx, task).await.map_err(TaskFailure::from)
            }
        }
    }

    /// Handle a round's retryable failures: bump each task's attempt count
    /// (terminal once the budget is spent), then rewind everything to just
    /// below the lowest failing checkpoint. The rewind clamps every
    /// function, so any write the revert discarded — a round sibling's or
    /// earlier work from an unrelated function — is reloaded and re-run.
    async fn retry_round_failures(
        &self,
        failures: Vec<(String, Checkpoint, String)>,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut revert_to = Checkpoint::MAX;
        let mut exhausted: Option<(String, String)> = None;
        {
            let mut state = inner.state.lock().await;
            for (function, checkpoint, message) in &failures {
                let attempts = state
                    .retry_attempts
                    .entry((function.clone(), *checkpoint))
                    .or_insert(0);
                *attempts += 1;
                inner.metrics.record_retry(function);
                if *attempts >= inner.config.task_attempts.max(1) {
                    exhausted.get_or_insert((function.clone(), message.clone()));
                } else {
                    warn!(
                        function = %function,
                        checkpoint = %checkpoint,
                        attempt = *attempts,
                        "indexing task failed, rewinding and retrying"
                    );
                }
                revert_to = revert_to.min(revert_point(*checkpoint));
            }
        }
        if let Some((function, message)) = exhausted {
            self.terminal_failure(&function, message).await;
            return Ok(());
        }
        self.rewind(revert_to).await
    }

    /// Revert the entity store to `safe` and clamp all scheduler state to
    /// it, so the load path re-delivers everything above. Shared shape with
    /// reorg handling; cancellation is not an error.
    async fn rewind(&self, safe: Checkpoint) -> Result<(), EngineError> {
        let result = self
            .inner
            .loading_lock
            .run_exclusive(async {
                let mut state = self.inner.state.lock().await;
                self.inner.entity_store.revert(safe).await?;
                clamp_functions(&mut state.functions, safe);
                for setup in state.setup_tasks.iter_mut() {
                    // A reverted setup's writes are gone; run it again.
                    if setup.checkpoint > safe {
                        setup.done = false;
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Ok(inner_result) => inner_result,
            Err(e) if e.is_canceled() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn terminal_failure(&self, function: &str, message: String) {
        let inner = &self.inner;
        inner.is_paused.store(true, Ordering::SeqCst);
        {
            let mut state = inner.state.lock().await;
            for f in state.functions.values_mut() {
                f.loaded_tasks.clear();
            }
        }
        inner.metrics.set_has_error(true);
        error!(function, %message, "indexing halted on terminal task failure");
        let _ = inner.events_tx.send(SchedulerEvent::Error {
            function: function.to_string(),
            message,
        });
    }

    // ─── Progress & plumbing ─────────────────────────────────────────────────

    async fn emit_progress(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let Some(min_checkpoint) = state
            .functions
            .values()
            .map(FunctionState::state_checkpoint)
            .min()
        else {
            return;
        };
        if min_checkpoint > state.last_emitted_progress {
            state.last_emitted_progress = min_checkpoint;
            inner
                .metrics
                .set_completed_to_timestamp(min_checkpoint.block_timestamp);
            let _ = inner.events_tx.send(SchedulerEvent::EventsProcessed {
                to_checkpoint: min_checkpoint,
            });
        }
    }

    fn build_context(
        &self,
        chain_id: u64,
        network: String,
        block_number: u64,
        checkpoint: Checkpoint,
    ) -> IndexingContext {
        let inner = &self.inner;
        IndexingContext {
            network: NetworkInfo {
                name: network,
                chain_id,
            },
            client: CachedRpcClient::new(
                chain_id,
                block_number,
                inner.store.clone(),
                inner.transport.clone(),
            ),
            db: EntityDb::new(inner.entity_store.clone(), checkpoint),
            contracts: inner.contracts.clone(),
        }
    }

    /// Zero-delay yield on a sparse schedule so progress surfaces and
    /// shutdown signals get a chance to land on busy single-threaded runs.
    async fn maybe_yield(&self) {
        if self.inner.yield_counter.fetch_add(1, Ordering::Relaxed) % 100 == 0 {
            tokio::task::yield_now().await;
        }
    }

    async fn drain_workers(&self) {
        let slots = self.inner.config.worker_concurrency as u32;
        if let Ok(permits) = self.inner.worker_slots.acquire_many(slots).await {
            drop(permits);
        }
    }

    fn start_flush_task(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = std::time::Duration::from_secs(self.inner.config.flush_interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let scheduler = IndexingScheduler { inner };
                if let Err(e) = scheduler.flush().await {
                    warn!(error = %e, "periodic flush failed");
                }
            }
        });
        if let Some(old) = self.inner.flush_task.lock().expect("flush lock").replace(handle) {
            old.abort();
        }
    }

    fn stop_flush_task(&self) {
        if let Some(handle) = self.inner.flush_task.lock().expect("flush lock").take() {
            handle.abort();
        }
    }
}

/// Per-key budget for one load pass:
/// `(max - Σ buffered over fully-loaded keys) / unfinished keys`.
/// Returns 0 when no key is unfinished.
fn task_batch_size(
    functions: &HashMap<String, FunctionState>,
    target: Checkpoint,
    max_batch_size: usize,
) -> usize {
    let buffered: usize = functions
        .values()
        .filter(|f| f.is_fully_loaded(target))
        .map(|f| f.loaded_tasks.len())
        .sum();
    let unfinished = functions
        .values()
        .filter(|f| !f.is_fully_loaded(target))
        .count();
    if unfinished == 0 {
        return 0;
    }
    max_batch_size.saturating_sub(buffered) / unfinished
}

fn build_events_args(
    registered: &RegisteredFunction,
    from: Checkpoint,
    to: Checkpoint,
    limit: usize,
) -> GetLogEventsArgs {
    let mut log_filters = Vec::new();
    let mut factories = Vec::new();
    for source in &registered.sources {
        match source {
            EventSource::LogFilter {
                chain_id,
                criteria,
                start_block,
                end_block,
                ..
            } => log_filters.push(LogFilterQuery {
                chain_id: *chain_id,
                criteria: criteria.clone(),
                from_block: Some(*start_block),
                to_block: *end_block,
                include_event_selectors: vec![registered.abi_event.selector.clone()],
            }),
            EventSource::Factory {
                chain_id,
                criteria,
                start_block,
                end_block,
                ..
            } => factories.push(FactoryQuery {
                chain_id: *chain_id,
                criteria: criteria.clone(),
                from_block: Some(*start_block),
                to_block: *end_block,
                include_event_selectors: vec![registered.abi_event.selector.clone()],
            }),
        }
    }
    GetLogEventsArgs {
        from_checkpoint: from,
        to_checkpoint: to,
        limit,
        log_filters,
        factories,
    }
}

fn network_for_chain(registered: &RegisteredFunction, chain_id: u64) -> String {
    registered
        .sources
        .iter()
        .find(|source| source.chain_id() == chain_id)
        .map(|source| source.network().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Clamp every function's checkpoints to `safe` and drop buffered tasks
/// above it. The loader then re-fetches (and the dispatcher re-runs)
/// everything past the clamp.
fn clamp_functions(functions: &mut HashMap<String, FunctionState>, safe: Checkpoint) {
    for function in functions.values_mut() {
        function.tasks_processed_to = function.tasks_processed_to.min(safe);
        function.tasks_loaded_from = function.tasks_loaded_from.min(safe);
        function.tasks_loaded_to = function.tasks_loaded_to.min(safe);
        function
            .loaded_tasks
            .retain(|task| task.checkpoint <= safe);
    }
}

/// The checkpoint immediately below `c` in the version order: reverting to
/// it drops the writes of the task at `c` while keeping everything earlier.
fn revert_point(c: Checkpoint) -> Checkpoint {
    match c.log_index {
        Some(i) if i > 0 => Checkpoint::of_log(c.block_timestamp, c.chain_id, c.block_number, i - 1),
        _ if c.block_number > 0 => {
            Checkpoint::of_block(c.block_timestamp, c.chain_id, c.block_number - 1)
        }
        _ => Checkpoint::ZERO,
    }
}

/// Pop every task eligible to run this round, per the four dispatch cases.
fn collect_round(state: &mut SchedulerState) -> Vec<RoundTask> {
    let mut round = Vec::new();

    // Setup functions run first, alone in their round.
    let pending_setups: Vec<RoundTask> = state
        .setup_tasks
        .iter()
        .enumerate()
        .filter(|(_, setup)| !setup.done)
        .map(|(index, setup)| RoundTask::Setup {
            index,
            key: setup.key.clone(),
            chain_id: setup.chain_id,
            network: setup.network.clone(),
            start_block: setup.start_block,
            checkpoint: setup.checkpoint,
        })
        .collect();
    if !pending_setups.is_empty() {
        return pending_setups;
    }

    let keys: Vec<String> = state.functions.keys().cloned().collect();
    for key in keys {
        let (parents, is_self_dependent, own_loaded_from) = {
            let function = &state.functions[&key];
            if function.loaded_tasks.is_empty() {
                continue;
            }
            (
                function.parents.clone(),
                function.is_self_dependent,
                function.tasks_loaded_from,
            )
        };
        let parent_min = parents
            .iter()
            .filter_map(|parent| state.functions.get(parent))
            .map(|parent| parent.tasks_loaded_from)
            .min();

        let function = match state.functions.get_mut(&key) {
            Some(f) => f,
            None => continue,
        };
        let head = match function.loaded_tasks.front() {
            Some(task) => task.checkpoint,
            None => continue,
        };

        match (parent_min, is_self_dependent) {
            // Case 1: serial within itself.
            (None, true) => {
                if own_loaded_from >= head {
                    if let Some(task) = function.loaded_tasks.pop_front() {
                        round.push(RoundTask::Log(Box::new(task)));
                    }
                }
            }
            // Case 2: unconstrained, everything buffered runs.
            (None, false) => {
                round.extend(
                    function
                        .loaded_tasks
                        .drain(..)
                        .map(|task| RoundTask::Log(Box::new(task))),
                );
            }
            // Case 3: serial, gated on parents and itself.
            (Some(parent_min), true) => {
                if parent_min.min(own_loaded_from) >= head {
                    if let Some(task) = function.loaded_tasks.pop_front() {
                        round.push(RoundTask::Log(Box::new(task)));
                    }
                }
            }
            // Case 4: the contiguous prefix the parents have covered.
            (Some(parent_min), false) => {
                while function
                    .loaded_tasks
                    .front()
                    .is_some_and(|task| task.checkpoint <= parent_min)
                {
                    if let Some(task) = function.loaded_tasks.pop_front() {
                        round.push(RoundTask::Log(Box::new(task)));
                    }
                }
            }
        }
    }
    round
}
