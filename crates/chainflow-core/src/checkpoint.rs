//! Cross-chain checkpoint algebra.
//!
//! A [`Checkpoint`] totally orders events across chains by
//! `(block_timestamp, chain_id, block_number, log_index)`, compared
//! lexicographically in that field order. A checkpoint without a log index
//! is a *block-level* position: depending on where it is used it means
//! either "before anything in this block" or "after everything in this
//! block". Callers pick the interpretation via [`BlockBoundary`].

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of a block a log-index-less checkpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockBoundary {
    /// Before the first log of the block — compares below any concrete index.
    Start,
    /// After the last log of the block — compares above any concrete index.
    End,
}

/// A position in the merged cross-chain event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unix timestamp of the block (seconds).
    pub block_timestamp: u64,
    /// Numeric chain id.
    pub chain_id: u64,
    /// Block number.
    pub block_number: u64,
    /// Log index within the block; `None` is a block-level position.
    pub log_index: Option<u32>,
}

impl Checkpoint {
    /// The minimum checkpoint: all fields zero.
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
        log_index: Some(0),
    };

    /// The maximum checkpoint: all fields saturated.
    pub const MAX: Checkpoint = Checkpoint {
        block_timestamp: u64::MAX,
        chain_id: u64::MAX,
        block_number: u64::MAX,
        log_index: None,
    };

    /// Checkpoint of a concrete log.
    pub fn of_log(block_timestamp: u64, chain_id: u64, block_number: u64, log_index: u32) -> Self {
        Self {
            block_timestamp,
            chain_id,
            block_number,
            log_index: Some(log_index),
        }
    }

    /// Block-level checkpoint (no log index).
    pub fn of_block(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Self {
            block_timestamp,
            chain_id,
            block_number,
            log_index: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Compare with an explicit interpretation for missing log indexes.
    pub fn compare(&self, other: &Checkpoint, boundary: BlockBoundary) -> Ordering {
        let prefix = (self.block_timestamp, self.chain_id, self.block_number).cmp(&(
            other.block_timestamp,
            other.chain_id,
            other.block_number,
        ));
        if prefix != Ordering::Equal {
            return prefix;
        }
        let rank = |ix: Option<u32>| match (ix, boundary) {
            (Some(i), _) => i as i64,
            (None, BlockBoundary::Start) => -1,
            (None, BlockBoundary::End) => i64::MAX,
        };
        rank(self.log_index).cmp(&rank(other.log_index))
    }

    /// Encode as a fixed-width string that sorts in checkpoint order.
    ///
    /// Used for the persisted `from_checkpoint` / `to_checkpoint` columns so
    /// that text comparison in SQL matches the checkpoint total order. The
    /// missing log index encodes as one past `u32::MAX`.
    pub fn encode(&self) -> String {
        let log_index = match self.log_index {
            Some(i) => i as u64,
            None => u32::MAX as u64 + 1,
        };
        format!(
            "{:020}{:020}{:020}{:010}",
            self.block_timestamp, self.chain_id, self.block_number, log_index
        )
    }

    /// Decode a string produced by [`Checkpoint::encode`].
    pub fn decode(s: &str) -> Option<Self> {
        if s.len() != 70 {
            return None;
        }
        let block_timestamp = s[0..20].parse().ok()?;
        let chain_id = s[20..40].parse().ok()?;
        let block_number = s[40..60].parse().ok()?;
        let raw_index: u64 = s[60..70].parse().ok()?;
        let log_index = if raw_index > u32::MAX as u64 {
            None
        } else {
            Some(raw_index as u32)
        };
        Some(Self {
            block_timestamp,
            chain_id,
            block_number,
            log_index,
        })
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::ZERO
    }
}

/// The default total order treats a missing log index as end-of-block: a
/// block-level checkpoint means everything in that block is behind it. The
/// gateway and scheduler rely on this; query code that needs block-begin
/// semantics uses [`Checkpoint::compare`] with [`BlockBoundary::Start`].
impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other, BlockBoundary::End)
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.log_index {
            Some(i) => write!(
                f,
                "{}:{}:{}:{}",
                self.block_timestamp, self.chain_id, self.block_number, i
            ),
            None => write!(
                f,
                "{}:{}:{}:end",
                self.block_timestamp, self.chain_id, self.block_number
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(ts: u64, chain: u64, block: u64, index: u32) -> Checkpoint {
        Checkpoint::of_log(ts, chain, block, index)
    }

    #[test]
    fn lexicographic_field_order() {
        assert!(cp(10, 1, 100, 5) < cp(11, 0, 0, 0));
        assert!(cp(10, 1, 100, 5) < cp(10, 2, 0, 0));
        assert!(cp(10, 1, 100, 5) < cp(10, 1, 101, 0));
        assert!(cp(10, 1, 100, 5) < cp(10, 1, 100, 6));
        assert_eq!(cp(10, 1, 100, 5), cp(10, 1, 100, 5));
    }

    #[test]
    fn block_level_is_end_of_block_by_default() {
        let block = Checkpoint::of_block(10, 1, 100);
        assert!(block > cp(10, 1, 100, u32::MAX));
        assert!(block < cp(10, 1, 101, 0));
    }

    #[test]
    fn block_level_as_start_boundary() {
        let block = Checkpoint::of_block(10, 1, 100);
        assert_eq!(
            block.compare(&cp(10, 1, 100, 0), BlockBoundary::Start),
            Ordering::Less
        );
        assert_eq!(
            block.compare(&cp(10, 1, 99, 7), BlockBoundary::Start),
            Ordering::Greater
        );
    }

    #[test]
    fn zero_and_max_are_extremes() {
        let samples = [
            cp(0, 0, 0, 0),
            cp(10, 1, 100, 5),
            Checkpoint::of_block(10, 1, 100),
            cp(u64::MAX, u64::MAX, u64::MAX, u32::MAX),
        ];
        for s in samples {
            assert!(Checkpoint::ZERO <= s);
            assert!(s <= Checkpoint::MAX);
        }
    }

    #[test]
    fn min_max_pick_by_order() {
        let a = cp(10, 1, 100, 5);
        let b = cp(10, 2, 50, 0);
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn encode_roundtrip() {
        let samples = [
            Checkpoint::ZERO,
            cp(10, 1, 100, 5),
            Checkpoint::of_block(1_700_000_000, 8453, 12_345_678),
            Checkpoint::MAX,
        ];
        for s in samples {
            assert_eq!(Checkpoint::decode(&s.encode()), Some(s));
        }
    }

    #[test]
    fn encode_preserves_order() {
        let mut samples = vec![
            cp(10, 1, 100, 5),
            Checkpoint::of_block(10, 1, 100),
            cp(10, 1, 100, 6),
            cp(9, 9, 9, 9),
            cp(10, 1, 101, 0),
        ];
        let mut encoded: Vec<String> = samples.iter().map(Checkpoint::encode).collect();
        samples.sort();
        encoded.sort();
        let sorted: Vec<String> = samples.iter().map(Checkpoint::encode).collect();
        assert_eq!(encoded, sorted);
    }
}
