//! chainflow-store — durable, idempotent storage for chain data.
//!
//! The sync store persists blocks, transactions, and logs exactly as the
//! collectors hand them over, keeps *interval bookkeeping* describing which
//! block ranges of which filter fragment have been synced, caches RPC reads
//! for deterministic replay, and serves ordered event pages to the indexing
//! scheduler.
//!
//! Two backends ship: [`sqlite::SqliteSyncStore`] and
//! [`postgres::PostgresSyncStore`]. All writes are insert-or-ignore on the
//! natural key, so the historical and realtime paths can race without
//! duplicating rows.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::filter::{FactoryCriteria, LogFilterCriteria};
use chainflow_core::interval::Interval;
use chainflow_core::types::{Block, Log, Transaction};

pub mod encoding;
pub mod metrics;
pub mod postgres;
mod retry;
pub mod sqlite;

pub use metrics::StoreMetrics;
pub use postgres::PostgresSyncStore;
pub use sqlite::SqliteSyncStore;

/// Errors surfaced by sync store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient database fault — retried by the store's envelope.
    #[error("database error: {0}")]
    Database(String),

    /// Distinguished non-retryable kind; aborts the retry envelope.
    #[error("{0}")]
    NonRetryable(String),

    /// A stored value could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    pub(crate) fn db(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// A log filter plus the block range and event selectors to page over.
#[derive(Debug, Clone)]
pub struct LogFilterQuery {
    pub chain_id: u64,
    pub criteria: LogFilterCriteria,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    /// Only logs whose `topic0` is one of these selectors match. Empty
    /// means any topic0.
    pub include_event_selectors: Vec<String>,
}

/// A factory-derived filter: matches logs emitted by the factory's
/// announced children.
#[derive(Debug, Clone)]
pub struct FactoryQuery {
    pub chain_id: u64,
    pub criteria: FactoryCriteria,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub include_event_selectors: Vec<String>,
}

/// Arguments to [`SyncStore::get_log_events`].
#[derive(Debug, Clone)]
pub struct GetLogEventsArgs {
    /// Exclusive lower bound (end-of-block when it has no log index).
    pub from_checkpoint: Checkpoint,
    /// Inclusive upper bound.
    pub to_checkpoint: Checkpoint,
    /// Page size; the store fetches `limit + 1` rows to detect truncation.
    pub limit: usize,
    pub log_filters: Vec<LogFilterQuery>,
    pub factories: Vec<FactoryQuery>,
}

/// An undecoded event: the log joined with its block and transaction.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub chain_id: u64,
    pub log: Log,
    pub block: Block,
    pub transaction: Transaction,
    pub checkpoint: Checkpoint,
}

/// One page of ordered events.
#[derive(Debug, Clone)]
pub struct LogEventPage {
    /// Ascending by `(timestamp, chain_id, block_number, log_index)`.
    pub events: Vec<LogEvent>,
    pub has_next_page: bool,
    /// Checkpoint of the last returned event, if any.
    pub last_checkpoint_in_page: Option<Checkpoint>,
    /// Checkpoint of the newest matching event in the whole window,
    /// regardless of the page limit.
    pub last_checkpoint: Option<Checkpoint>,
}

/// Persisted progress of one indexing function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub function_id: String,
    pub function_name: String,
    pub from_checkpoint: Checkpoint,
    pub to_checkpoint: Checkpoint,
    pub event_count: u64,
}

/// Durable, idempotent storage of EVM chain data plus interval bookkeeping.
///
/// Every operation is wrapped in a retry envelope (3 retries, exponential
/// backoff from 100 ms); [`StoreError::NonRetryable`] short-circuits it.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Upsert a block with its transactions and logs, and append `interval`
    /// to every fragment of `filter`, in one transaction.
    async fn insert_log_filter_interval(
        &self,
        chain_id: u64,
        filter: &LogFilterCriteria,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
        interval: Interval,
    ) -> Result<(), StoreError>;

    /// Compact each fragment's interval rows, then return the filter's
    /// synced ranges (the intersection of its fragments' unions).
    async fn get_log_filter_intervals(
        &self,
        chain_id: u64,
        filter: &LogFilterCriteria,
    ) -> Result<Vec<Interval>, StoreError>;

    async fn insert_factory_log_filter_interval(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
        interval: Interval,
    ) -> Result<(), StoreError>;

    async fn get_factory_log_filter_intervals(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
    ) -> Result<Vec<Interval>, StoreError>;

    /// Bulk idempotent insert of factory announcement logs.
    async fn insert_factory_child_address_logs(
        &self,
        chain_id: u64,
        logs: &[Log],
    ) -> Result<(), StoreError>;

    /// Child addresses announced by `factory` up to `up_to_block`, in pages
    /// of `page_size`, ascending by block number. The stream ends after the
    /// first short page.
    fn get_factory_child_addresses(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
        up_to_block: u64,
        page_size: usize,
    ) -> BoxStream<'static, Result<Vec<String>, StoreError>>;

    /// Idempotent upserts for an unfinalized block. Does not touch interval
    /// tables; those are written at finality via
    /// [`SyncStore::insert_realtime_interval`].
    async fn insert_realtime_block(
        &self,
        chain_id: u64,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<(), StoreError>;

    /// Append a finalized interval to every fragment of every given source.
    async fn insert_realtime_interval(
        &self,
        chain_id: u64,
        log_filters: &[LogFilterCriteria],
        factories: &[FactoryCriteria],
        interval: Interval,
    ) -> Result<(), StoreError>;

    /// Drop unfinalized data above `from_block`: data rows are deleted,
    /// interval rows above it are deleted, straddling ones are clamped.
    async fn delete_realtime_data(&self, chain_id: u64, from_block: u64)
        -> Result<(), StoreError>;

    async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
        result: &str,
    ) -> Result<(), StoreError>;

    async fn get_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
    ) -> Result<Option<String>, StoreError>;

    /// One ordered page of events matching any of the given sources within
    /// `(from_checkpoint, to_checkpoint]`.
    async fn get_log_events(&self, args: &GetLogEventsArgs) -> Result<LogEventPage, StoreError>;

    async fn upsert_function_metadata(
        &self,
        rows: &[FunctionMetadata],
    ) -> Result<(), StoreError>;

    async fn get_function_metadata(
        &self,
        function_ids: &[String],
    ) -> Result<Vec<FunctionMetadata>, StoreError>;
}
