//! Log filters, factories, and their fragments.
//!
//! A filter slot (`address`, `topic0`..`topic3`) may hold several values,
//! OR-ed together. Interval bookkeeping works on *fragments*: fully
//! specialized filters with at most one value per slot, produced by the
//! cross product of the array slots. A filter's synced range is then the
//! intersection of its fragments' ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{normalize_hex, Log};

/// Address + topic criteria of a log filter. Empty vec = wildcard slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilterCriteria {
    pub address: Vec<String>,
    pub topic0: Vec<String>,
    pub topic1: Vec<String>,
    pub topic2: Vec<String>,
    pub topic3: Vec<String>,
}

impl LogFilterCriteria {
    /// Criteria matching a single contract address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            address: vec![normalize_hex(&addr.into())],
            ..Default::default()
        }
    }

    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        self.topic0.push(normalize_hex(&topic.into()));
        self
    }

    /// Expand into fully specialized fragments (cross product of slots).
    pub fn fragments(&self, chain_id: u64) -> Vec<LogFilterFragment> {
        let mut out = Vec::new();
        for address in slot_values(&self.address) {
            for topic0 in slot_values(&self.topic0) {
                for topic1 in slot_values(&self.topic1) {
                    for topic2 in slot_values(&self.topic2) {
                        for topic3 in slot_values(&self.topic3) {
                            out.push(LogFilterFragment::new(
                                chain_id,
                                address.clone(),
                                topic0.clone(),
                                topic1.clone(),
                                topic2.clone(),
                                topic3.clone(),
                            ));
                        }
                    }
                }
            }
        }
        out
    }

    /// Whether `log` satisfies the address and topic predicates.
    pub fn matches(&self, log: &Log) -> bool {
        let slot_matches = |values: &[String], actual: Option<&str>| {
            values.is_empty()
                || actual
                    .map(|a| values.iter().any(|v| v.eq_ignore_ascii_case(a)))
                    .unwrap_or(false)
        };
        slot_matches(&self.address, Some(&log.address))
            && slot_matches(&self.topic0, log.topic(0))
            && slot_matches(&self.topic1, log.topic(1))
            && slot_matches(&self.topic2, log.topic(2))
            && slot_matches(&self.topic3, log.topic(3))
    }
}

fn slot_values(values: &[String]) -> Vec<Option<String>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.iter().map(|v| Some(normalize_hex(v))).collect()
    }
}

/// A fully specialized log filter: at most one value per slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilterFragment {
    /// Deterministic fingerprint of the fragment, used as its row id.
    pub id: String,
    pub chain_id: u64,
    pub address: Option<String>,
    pub topic0: Option<String>,
    pub topic1: Option<String>,
    pub topic2: Option<String>,
    pub topic3: Option<String>,
}

impl LogFilterFragment {
    fn new(
        chain_id: u64,
        address: Option<String>,
        topic0: Option<String>,
        topic1: Option<String>,
        topic2: Option<String>,
        topic3: Option<String>,
    ) -> Self {
        let id = format!(
            "{}_{}_{}_{}_{}_{}",
            chain_id,
            slot_id(&address),
            slot_id(&topic0),
            slot_id(&topic1),
            slot_id(&topic2),
            slot_id(&topic3),
        );
        Self {
            id,
            chain_id,
            address,
            topic0,
            topic1,
            topic2,
            topic3,
        }
    }
}

fn slot_id(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("null")
}

/// Where a factory's child address lives in its announcement log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildAddressLocation {
    /// A topic slot (1..=3); the address is the last 20 bytes of the topic.
    Topic(usize),
    /// A byte offset into `data`; the address is the 20 bytes starting at
    /// byte `12 + offset` (skipping the word's zero padding).
    Offset(usize),
}

impl ChildAddressLocation {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if let Some(slot) = s.strip_prefix("topic") {
            let slot: usize = slot
                .parse()
                .map_err(|_| CoreError::InvalidChildAddressLocation(s.to_string()))?;
            if (1..=3).contains(&slot) {
                return Ok(Self::Topic(slot));
            }
        } else if let Some(offset) = s.strip_prefix("offset") {
            if let Ok(offset) = offset.parse() {
                return Ok(Self::Offset(offset));
            }
        }
        Err(CoreError::InvalidChildAddressLocation(s.to_string()))
    }
}

impl fmt::Display for ChildAddressLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(slot) => write!(f, "topic{slot}"),
            Self::Offset(offset) => write!(f, "offset{offset}"),
        }
    }
}

impl Serialize for ChildAddressLocation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChildAddressLocation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// How to derive a factory's child contract addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryCriteria {
    /// The factory contract address.
    pub address: String,
    /// `topics[0]` of the announcement event.
    pub event_selector: String,
    pub child_address_location: ChildAddressLocation,
}

impl FactoryCriteria {
    /// Deterministic fingerprint, used as the factory's row id.
    pub fn fragment_id(&self, chain_id: u64) -> String {
        format!(
            "{}_{}_{}_{}",
            chain_id,
            normalize_hex(&self.address),
            normalize_hex(&self.event_selector),
            self.child_address_location
        )
    }

    /// Extract the child address from an announcement log, if well-formed.
    pub fn extract_child_address(&self, log: &Log) -> Option<String> {
        match self.child_address_location {
            ChildAddressLocation::Topic(slot) => {
                let topic = log.topic(slot)?;
                let digits = topic.strip_prefix("0x")?;
                if digits.len() != 64 {
                    return None;
                }
                Some(format!("0x{}", &digits[24..].to_ascii_lowercase()))
            }
            ChildAddressLocation::Offset(offset) => {
                let digits = log.data.strip_prefix("0x")?;
                let start = 2 * (12 + offset);
                let end = start + 40;
                if digits.len() < end {
                    return None;
                }
                Some(format!("0x{}", &digits[start..end].to_ascii_lowercase()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(topics: Vec<&str>, data: &str) -> Log {
        Log {
            address: "0xfac".into(),
            block_hash: "0xb".into(),
            block_number: 1,
            log_index: 0,
            transaction_hash: "0xt".into(),
            transaction_index: 0,
            data: data.into(),
            topics: topics.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn fragments_cross_product() {
        let criteria = LogFilterCriteria {
            address: vec!["0xaaaa".into(), "0xbbbb".into()],
            topic0: vec!["0x1111".into()],
            ..Default::default()
        };
        let fragments = criteria.fragments(1);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].id, "1_0xaaaa_0x1111_null_null_null");
        assert_eq!(fragments[1].id, "1_0xbbbb_0x1111_null_null_null");
    }

    #[test]
    fn wildcard_filter_is_one_fragment() {
        let fragments = LogFilterCriteria::default().fragments(10);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].id, "10_null_null_null_null_null");
    }

    #[test]
    fn matches_respects_slots() {
        let criteria = LogFilterCriteria::address("0xAAAA").topic0("0x1111");
        let hit = log_with(vec!["0x1111"], "0x");
        let hit = Log {
            address: "0xaaaa".into(),
            ..hit
        };
        assert!(criteria.matches(&hit));

        let miss = Log {
            topics: vec!["0x2222".into()],
            ..hit.clone()
        };
        assert!(!criteria.matches(&miss));

        // Topic filter against a log with no topics never matches.
        let bare = Log {
            topics: vec![],
            ..hit
        };
        assert!(!criteria.matches(&bare));
    }

    #[test]
    fn child_address_location_parse_roundtrip() {
        for s in ["topic1", "topic2", "topic3", "offset0", "offset32"] {
            assert_eq!(ChildAddressLocation::parse(s).unwrap().to_string(), s);
        }
        assert!(ChildAddressLocation::parse("topic0").is_err());
        assert!(ChildAddressLocation::parse("topic4").is_err());
        assert!(ChildAddressLocation::parse("word3").is_err());
    }

    #[test]
    fn extract_child_from_topic() {
        let factory = FactoryCriteria {
            address: "0xfac".into(),
            event_selector: "0xsel".into(),
            child_address_location: ChildAddressLocation::Topic(1),
        };
        let child = "000000000000000000000000111122223333444455556666777788889999aaaa";
        let log = log_with(vec!["0xsel", &format!("0x{child}")], "0x");
        assert_eq!(
            factory.extract_child_address(&log).unwrap(),
            "0x111122223333444455556666777788889999aaaa"
        );
    }

    #[test]
    fn extract_child_from_data_offset() {
        let factory = FactoryCriteria {
            address: "0xfac".into(),
            event_selector: "0xsel".into(),
            child_address_location: ChildAddressLocation::Offset(32),
        };
        // data = one 32-byte word, then an address word.
        let data = format!(
            "0x{}{}{}",
            "11".repeat(32),
            "00".repeat(12),
            "ab".repeat(20)
        );
        let log = log_with(vec!["0xsel"], &data);
        assert_eq!(
            factory.extract_child_address(&log).unwrap(),
            format!("0x{}", "ab".repeat(20))
        );
    }

    #[test]
    fn extract_child_rejects_short_data() {
        let factory = FactoryCriteria {
            address: "0xfac".into(),
            event_selector: "0xsel".into(),
            child_address_location: ChildAddressLocation::Offset(64),
        };
        let log = log_with(vec!["0xsel"], "0x1234");
        assert!(factory.extract_child_address(&log).is_none());
    }
}
