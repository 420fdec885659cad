//! Sync gateway: fuses per-chain progress into one global checkpoint.
//!
//! Each chain reports historical, realtime, and finality checkpoints plus a
//! historical-complete flag. The reducer takes
//! `best(chain) = complete ? max(historical, realtime) : historical` and the
//! global checkpoint is the minimum of the bests, so an event stream cut at
//! the global checkpoint is totally ordered across every chain. Emissions
//! happen only on strict advance; stale or out-of-order inputs are silently
//! absorbed by monotonicity — the gateway never fails.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chainflow_core::checkpoint::Checkpoint;

/// Events emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The global checkpoint advanced: events up to it may be delivered.
    Checkpoint(Checkpoint),
    /// The global finality checkpoint advanced.
    FinalityCheckpoint(Checkpoint),
    /// A chain reorganized; everything after the safe checkpoint is suspect.
    Reorg(Checkpoint),
}

#[derive(Debug, Default, Clone)]
struct ChainSyncState {
    historical: Checkpoint,
    realtime: Checkpoint,
    finality: Checkpoint,
    is_historical_complete: bool,
}

impl ChainSyncState {
    fn best(&self) -> Checkpoint {
        if self.is_historical_complete {
            self.historical.max(self.realtime)
        } else {
            self.historical
        }
    }
}

/// Cross-chain checkpoint reducer.
pub struct SyncGateway {
    chains: HashMap<u64, ChainSyncState>,
    checkpoint: Checkpoint,
    finality_checkpoint: Checkpoint,
    events_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl SyncGateway {
    /// Create a gateway tracking the given chains.
    pub fn new(chain_ids: &[u64]) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let chains = chain_ids
            .iter()
            .map(|id| (*id, ChainSyncState::default()))
            .collect();
        (
            Self {
                chains,
                checkpoint: Checkpoint::ZERO,
                finality_checkpoint: Checkpoint::ZERO,
                events_tx,
            },
            events_rx,
        )
    }

    /// The current global checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    /// The current global finality checkpoint.
    pub fn finality_checkpoint(&self) -> Checkpoint {
        self.finality_checkpoint
    }

    pub fn handle_new_historical_checkpoint(&mut self, checkpoint: Checkpoint) {
        let Some(chain) = self.chains.get_mut(&checkpoint.chain_id) else {
            warn!(chain_id = checkpoint.chain_id, "checkpoint for unknown chain");
            return;
        };
        if checkpoint > chain.historical {
            chain.historical = checkpoint;
            self.recompute_checkpoint();
        }
    }

    pub fn handle_historical_sync_complete(&mut self, chain_id: u64) {
        let Some(chain) = self.chains.get_mut(&chain_id) else {
            warn!(chain_id, "sync complete for unknown chain");
            return;
        };
        chain.is_historical_complete = true;
        info!(chain_id, "historical sync complete");
        self.recompute_checkpoint();
    }

    pub fn handle_new_realtime_checkpoint(&mut self, checkpoint: Checkpoint) {
        let Some(chain) = self.chains.get_mut(&checkpoint.chain_id) else {
            warn!(chain_id = checkpoint.chain_id, "checkpoint for unknown chain");
            return;
        };
        if checkpoint > chain.realtime {
            chain.realtime = checkpoint;
            // Only observable once the chain's historical sync completed.
            self.recompute_checkpoint();
        }
    }

    pub fn handle_new_finality_checkpoint(&mut self, checkpoint: Checkpoint) {
        let Some(chain) = self.chains.get_mut(&checkpoint.chain_id) else {
            warn!(chain_id = checkpoint.chain_id, "checkpoint for unknown chain");
            return;
        };
        if checkpoint > chain.finality {
            chain.finality = checkpoint;
            self.recompute_finality_checkpoint();
        }
    }

    /// Relay a reorg signal from a realtime collector.
    pub fn handle_reorg(&self, safe_checkpoint: Checkpoint) {
        let _ = self.events_tx.send(GatewayEvent::Reorg(safe_checkpoint));
    }

    /// Forget everything about a chain (it is about to be re-synced).
    /// The global checkpoints drop back to zero and re-advance.
    pub fn reset_chain(&mut self, chain_id: u64) {
        if let Some(chain) = self.chains.get_mut(&chain_id) {
            *chain = ChainSyncState::default();
        }
        self.checkpoint = Checkpoint::ZERO;
        self.finality_checkpoint = Checkpoint::ZERO;
    }

    fn recompute_checkpoint(&mut self) {
        let Some(new_checkpoint) = self.chains.values().map(ChainSyncState::best).min() else {
            return;
        };
        if new_checkpoint > self.checkpoint {
            self.checkpoint = new_checkpoint;
            debug!(checkpoint = %new_checkpoint, "global checkpoint advanced");
            let _ = self
                .events_tx
                .send(GatewayEvent::Checkpoint(new_checkpoint));
        }
    }

    fn recompute_finality_checkpoint(&mut self) {
        let Some(new_checkpoint) = self.chains.values().map(|c| c.finality).min() else {
            return;
        };
        if new_checkpoint > self.finality_checkpoint {
            self.finality_checkpoint = new_checkpoint;
            debug!(checkpoint = %new_checkpoint, "global finality checkpoint advanced");
            let _ = self
                .events_tx
                .send(GatewayEvent::FinalityCheckpoint(new_checkpoint));
        }
    }
}
