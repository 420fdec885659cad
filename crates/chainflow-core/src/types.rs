//! RPC-shaped chain data rows.
//!
//! Blocks, transactions, and logs are stored the way EVM JSON-RPC shapes
//! them: hex-string hashes and addresses, numeric quantities parsed into
//! `u64` / `U256`. Collectors construct these rows from `eth_getBlockByNumber`
//! and `eth_getLogs` responses.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::CoreError;

/// A block row, keyed `(chain_id, hash)` in the sync store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    pub miner: String,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub base_fee_per_gas: Option<U256>,
    pub size: U256,
    pub total_difficulty: Option<U256>,
    pub state_root: String,
    pub transactions_root: String,
    pub receipts_root: String,
    pub logs_bloom: String,
    pub extra_data: String,
}

/// A transaction row, keyed `(chain_id, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_index: u32,
    pub from: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    pub value: U256,
    pub gas: U256,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub input: String,
    pub nonce: u64,
}

/// A log row, keyed `(chain_id, block_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: String,
    pub block_hash: String,
    pub block_number: u64,
    pub log_index: u32,
    pub transaction_hash: String,
    pub transaction_index: u32,
    pub data: String,
    /// `topics[0]` is the event selector; at most 4 entries.
    pub topics: Vec<String>,
}

impl Log {
    /// Synthetic primary key for the logs table.
    pub fn log_id(&self, chain_id: u64) -> String {
        format!("{}-{}-{}", chain_id, self.block_hash, self.log_index)
    }

    /// Topic at slot `i` (0..=3), if present.
    pub fn topic(&self, i: usize) -> Option<&str> {
        self.topics.get(i).map(String::as_str)
    }
}

/// Checkpoint of a log within its block.
pub fn log_checkpoint(chain_id: u64, block: &Block, log: &Log) -> Checkpoint {
    Checkpoint::of_log(block.timestamp, chain_id, block.number, log.log_index)
}

/// Parse a hex quantity (with or without `0x`) into a u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, CoreError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| CoreError::InvalidHex {
        value: s.to_string(),
        reason: e.to_string(),
    })
}

/// Lowercase a hex string, keeping the `0x` prefix.
pub fn normalize_hex(s: &str) -> String {
    s.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("12a05f200").unwrap(), 5_000_000_000);
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn log_id_is_deterministic() {
        let log = Log {
            address: "0xa".into(),
            block_hash: "0xbbb".into(),
            block_number: 100,
            log_index: 7,
            transaction_hash: "0xt".into(),
            transaction_index: 0,
            data: "0x".into(),
            topics: vec![],
        };
        assert_eq!(log.log_id(1), "1-0xbbb-7");
    }

    #[test]
    fn log_checkpoint_uses_block_fields() {
        let block = Block {
            number: 100,
            hash: "0xb".into(),
            parent_hash: "0x0".into(),
            timestamp: 1234,
            miner: "0xm".into(),
            gas_limit: U256::from(30_000_000u64),
            gas_used: U256::from(21_000u64),
            base_fee_per_gas: None,
            size: U256::from(500u64),
            total_difficulty: None,
            state_root: "0x".into(),
            transactions_root: "0x".into(),
            receipts_root: "0x".into(),
            logs_bloom: "0x".into(),
            extra_data: "0x".into(),
        };
        let log = Log {
            address: "0xa".into(),
            block_hash: "0xb".into(),
            block_number: 100,
            log_index: 3,
            transaction_hash: "0xt".into(),
            transaction_index: 1,
            data: "0x".into(),
            topics: vec![],
        };
        assert_eq!(
            log_checkpoint(5, &block, &log),
            Checkpoint::of_log(1234, 5, 100, 3)
        );
    }
}
