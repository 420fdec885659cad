//! chainflow-core — shared foundations of the chainflow indexing engine.
//!
//! # Architecture
//!
//! ```text
//! SyncGateway ── Checkpoint algebra ──┐
//! SyncStore  ── Interval algebra,     ├── IndexingScheduler
//!               filters & fragments ──┘
//! ```
//!
//! This crate holds the pure pieces: the cross-chain [`checkpoint::Checkpoint`]
//! total order, the closed-interval bookkeeping algebra, log filter / factory
//! fragment expansion, RPC-shaped chain rows, and ABI event decoding.

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod filter;
pub mod interval;
pub mod types;

pub use checkpoint::{BlockBoundary, Checkpoint};
pub use error::CoreError;
pub use event::AbiEvent;
pub use filter::{ChildAddressLocation, FactoryCriteria, LogFilterCriteria, LogFilterFragment};
pub use interval::{
    interval_difference, interval_intersection_many, interval_sum, interval_union, Interval,
};
pub use types::{Block, Log, Transaction};
