//! chainflow-engine — the indexing engine proper.
//!
//! # Architecture
//!
//! ```text
//! collectors ──▶ SyncGateway ──newCheckpoint──▶ IndexingScheduler
//!                                                  ├── FunctionRegistry (user handlers)
//!                                                  ├── EntityStore      (checkpointed CRUD)
//!                                                  └── SyncStore        (event pages)
//! ```
//!
//! The [`gateway::SyncGateway`] fuses per-chain historical/realtime/finality
//! progress into one monotone global checkpoint. The
//! [`scheduler::IndexingScheduler`] loads decoded events in budgeted batches
//! and dispatches them through user indexing functions under read/write
//! dependency constraints, rewinding the entity store on failures and chain
//! reorganizations.

use thiserror::Error;

use chainflow_store::StoreError;

pub mod config;
pub mod context;
pub mod entity;
pub mod gateway;
pub mod lock;
pub mod metrics;
pub mod observability;
pub mod registry;
pub mod scheduler;

pub use config::EngineConfig;
pub use context::{IndexingContext, NetworkInfo, RpcTransport};
pub use entity::{EntityStore, MemoryEntityStore};
pub use gateway::{GatewayEvent, SyncGateway};
pub use registry::{
    EventSource, FunctionError, FunctionRegistry, IndexingFunction, SetupFunction, TableAccess,
};
pub use scheduler::{IndexingScheduler, LogEventTask, SchedulerEvent};

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A user indexing function failed terminally.
    #[error("indexing function '{function}' failed: {reason}")]
    Task { function: String, reason: String },

    /// An entity store operation was invalid (missing row, duplicate id).
    #[error("entity store error: {0}")]
    Entity(String),

    /// Sentinel raised when a pending operation is canceled by `reset` or
    /// `kill`. Not a failure: callers treat it as "stop quietly".
    #[error("operation canceled")]
    Canceled,

    /// Unrecoverable; the supervisor should tear the process down.
    #[error("{0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
