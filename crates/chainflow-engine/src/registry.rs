//! User indexing functions and their registry.
//!
//! Each function is keyed `"{Contract}:{Event}"` and declares which entity
//! tables it reads and writes. The registry derives the dependency graph
//! from those declarations in two passes: invert writes into
//! `table → writers`, then `parents(f) = ⋃ writers(reads(f)) \ {f}`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use chainflow_core::error::CoreError;
use chainflow_core::event::AbiEvent;
use chainflow_core::filter::{FactoryCriteria, LogFilterCriteria};

use crate::context::IndexingContext;
use crate::scheduler::LogEventTask;

/// Error returned by user indexing code.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct FunctionError {
    pub reason: String,
    /// `false` jumps straight to the terminal branch, skipping retries.
    pub retryable: bool,
}

impl FunctionError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// A user function invoked once per matching decoded event.
#[async_trait]
pub trait IndexingFunction: Send + Sync {
    async fn invoke(
        &self,
        ctx: &IndexingContext,
        event: &LogEventTask,
    ) -> Result<(), FunctionError>;
}

/// A user function invoked once per chain before any events, keyed
/// `"{Contract}:setup"`.
#[async_trait]
pub trait SetupFunction: Send + Sync {
    async fn invoke(&self, ctx: &IndexingContext) -> Result<(), FunctionError>;
}

/// Entity tables a function touches. Drives the dependency graph.
#[derive(Debug, Clone, Default)]
pub struct TableAccess {
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

impl TableAccess {
    pub fn new(
        reads: impl IntoIterator<Item = impl Into<String>>,
        writes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            reads: reads.into_iter().map(Into::into).collect(),
            writes: writes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Where a function's events come from.
#[derive(Debug, Clone)]
pub enum EventSource {
    LogFilter {
        name: String,
        network: String,
        chain_id: u64,
        criteria: LogFilterCriteria,
        start_block: u64,
        end_block: Option<u64>,
    },
    Factory {
        name: String,
        network: String,
        chain_id: u64,
        criteria: FactoryCriteria,
        start_block: u64,
        end_block: Option<u64>,
    },
}

impl EventSource {
    pub fn chain_id(&self) -> u64 {
        match self {
            Self::LogFilter { chain_id, .. } | Self::Factory { chain_id, .. } => *chain_id,
        }
    }

    pub fn network(&self) -> &str {
        match self {
            Self::LogFilter { network, .. } | Self::Factory { network, .. } => network,
        }
    }

    pub fn start_block(&self) -> u64 {
        match self {
            Self::LogFilter { start_block, .. } | Self::Factory { start_block, .. } => {
                *start_block
            }
        }
    }
}

/// A registered `(contract, event)` indexing function.
#[derive(Clone)]
pub struct RegisteredFunction {
    pub key: String,
    pub function_id: String,
    pub abi_event: AbiEvent,
    pub handler: Arc<dyn IndexingFunction>,
    pub sources: Vec<EventSource>,
    pub table_access: TableAccess,
}

/// A registered setup function.
#[derive(Clone)]
pub struct RegisteredSetup {
    pub key: String,
    pub contract_name: String,
    pub function_id: String,
    pub handler: Arc<dyn SetupFunction>,
}

/// Parents and self-dependence of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    /// Keys whose writes intersect this function's reads, sorted.
    pub parents: Vec<String>,
    /// Whether the function writes a table it also reads.
    pub is_self_dependent: bool,
}

/// Lookup table `(contract, event) → handler`, built once per reset.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    log_functions: BTreeMap<String, RegisteredFunction>,
    setup_functions: BTreeMap<String, RegisteredSetup>,
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder::default()
    }

    pub fn log_functions(&self) -> impl Iterator<Item = &RegisteredFunction> {
        self.log_functions.values()
    }

    pub fn setup_functions(&self) -> impl Iterator<Item = &RegisteredSetup> {
        self.setup_functions.values()
    }

    pub fn get(&self, key: &str) -> Option<&RegisteredFunction> {
        self.log_functions.get(key)
    }

    pub fn get_setup(&self, key: &str) -> Option<&RegisteredSetup> {
        self.setup_functions.get(key)
    }

    /// All registered function ids (log + setup), for metadata lookups.
    pub fn function_ids(&self) -> Vec<String> {
        self.log_functions
            .values()
            .map(|f| f.function_id.clone())
            .chain(self.setup_functions.values().map(|f| f.function_id.clone()))
            .collect()
    }

    /// Chains a contract's sources cover, for per-chain setup enqueueing.
    /// Returns `(chain_id, network, start_block)`, deduplicated by chain.
    pub fn contract_chains(&self, contract_name: &str) -> Vec<(u64, String, u64)> {
        let mut seen = HashSet::new();
        let mut chains = Vec::new();
        for function in self.log_functions.values() {
            if function.abi_event.contract_name != contract_name {
                continue;
            }
            for source in &function.sources {
                if seen.insert(source.chain_id()) {
                    chains.push((
                        source.chain_id(),
                        source.network().to_string(),
                        source.start_block(),
                    ));
                }
            }
        }
        chains
    }

    /// Derive every function's parents and self-dependence.
    pub fn dependencies(&self) -> HashMap<String, Dependencies> {
        let mut writers: HashMap<&str, Vec<&str>> = HashMap::new();
        for function in self.log_functions.values() {
            for table in &function.table_access.writes {
                writers.entry(table).or_default().push(&function.key);
            }
        }

        self.log_functions
            .values()
            .map(|function| {
                let mut parents: Vec<String> = function
                    .table_access
                    .reads
                    .iter()
                    .flat_map(|table| writers.get(table.as_str()).into_iter().flatten())
                    .filter(|writer| **writer != function.key)
                    .map(|writer| writer.to_string())
                    .collect();
                parents.sort();
                parents.dedup();

                let reads: HashSet<&String> = function.table_access.reads.iter().collect();
                let is_self_dependent = function
                    .table_access
                    .writes
                    .iter()
                    .any(|table| reads.contains(table));

                (
                    function.key.clone(),
                    Dependencies {
                        parents,
                        is_self_dependent,
                    },
                )
            })
            .collect()
    }
}

#[derive(Default)]
pub struct FunctionRegistryBuilder {
    log_functions: BTreeMap<String, RegisteredFunction>,
    setup_functions: BTreeMap<String, RegisteredSetup>,
    duplicate: Option<String>,
}

impl FunctionRegistryBuilder {
    pub fn log_function(
        mut self,
        function_id: impl Into<String>,
        abi_event: AbiEvent,
        handler: Arc<dyn IndexingFunction>,
        sources: Vec<EventSource>,
        table_access: TableAccess,
    ) -> Self {
        let key = format!("{}:{}", abi_event.contract_name, abi_event.event_name);
        let function = RegisteredFunction {
            key: key.clone(),
            function_id: function_id.into(),
            abi_event,
            handler,
            sources,
            table_access,
        };
        if self.log_functions.insert(key.clone(), function).is_some() {
            self.duplicate.get_or_insert(key);
        }
        self
    }

    pub fn setup_function(
        mut self,
        function_id: impl Into<String>,
        contract_name: impl Into<String>,
        handler: Arc<dyn SetupFunction>,
    ) -> Self {
        let contract_name = contract_name.into();
        let key = format!("{contract_name}:setup");
        let setup = RegisteredSetup {
            key: key.clone(),
            contract_name,
            function_id: function_id.into(),
            handler,
        };
        if self.setup_functions.insert(key.clone(), setup).is_some() {
            self.duplicate.get_or_insert(key);
        }
        self
    }

    pub fn build(self) -> Result<FunctionRegistry, CoreError> {
        if let Some(key) = self.duplicate {
            return Err(CoreError::Validation(format!(
                "indexing function '{key}' registered twice"
            )));
        }
        Ok(FunctionRegistry {
            log_functions: self.log_functions,
            setup_functions: self.setup_functions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl IndexingFunction for Noop {
        async fn invoke(
            &self,
            _ctx: &IndexingContext,
            _event: &LogEventTask,
        ) -> Result<(), FunctionError> {
            Ok(())
        }
    }

    fn source(chain_id: u64) -> EventSource {
        EventSource::LogFilter {
            name: "Token".into(),
            network: "mainnet".into(),
            chain_id,
            criteria: LogFilterCriteria::address("0xaaaa"),
            start_block: 0,
            end_block: None,
        }
    }

    fn registry() -> FunctionRegistry {
        let transfer = AbiEvent::parse(
            "Token",
            "Transfer(address indexed from, address indexed to, uint256 value)",
        )
        .unwrap();
        let approval = AbiEvent::parse(
            "Token",
            "Approval(address indexed owner, address indexed spender, uint256 value)",
        )
        .unwrap();
        let sync = AbiEvent::parse("Pair", "Sync(uint112 reserve0, uint112 reserve1)").unwrap();

        FunctionRegistry::builder()
            .log_function(
                "fn-transfer",
                transfer,
                Arc::new(Noop),
                vec![source(1)],
                TableAccess::new(["accounts"], ["accounts", "transfers"]),
            )
            .log_function(
                "fn-approval",
                approval,
                Arc::new(Noop),
                vec![source(1)],
                TableAccess::new(["accounts"], ["approvals"]),
            )
            .log_function(
                "fn-sync",
                sync,
                Arc::new(Noop),
                vec![source(10)],
                TableAccess::new(["transfers"], ["pairs"]),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn dependency_graph_two_pass() {
        let deps = registry().dependencies();

        // Transfer writes a table it reads: self-dependent, no parents
        // (nothing else writes "accounts").
        let transfer = &deps["Token:Transfer"];
        assert!(transfer.is_self_dependent);
        assert!(transfer.parents.is_empty());

        // Approval reads "accounts", which Transfer writes.
        let approval = &deps["Token:Approval"];
        assert!(!approval.is_self_dependent);
        assert_eq!(approval.parents, vec!["Token:Transfer".to_string()]);

        // Sync reads "transfers", also written by Transfer.
        let sync = &deps["Pair:Sync"];
        assert!(!sync.is_self_dependent);
        assert_eq!(sync.parents, vec!["Token:Transfer".to_string()]);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let transfer = AbiEvent::parse("Token", "Transfer(address indexed from, address indexed to, uint256 value)").unwrap();
        let result = FunctionRegistry::builder()
            .log_function(
                "a",
                transfer.clone(),
                Arc::new(Noop),
                vec![],
                TableAccess::default(),
            )
            .log_function("b", transfer, Arc::new(Noop), vec![], TableAccess::default())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn contract_chains_deduplicates() {
        let registry = registry();
        let chains = registry.contract_chains("Token");
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].0, 1);

        let chains = registry.contract_chains("Pair");
        assert_eq!(chains, vec![(10, "mainnet".to_string(), 0)]);
    }
}
