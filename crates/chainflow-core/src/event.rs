//! ABI event descriptions and log decoding.
//!
//! Indexing functions are keyed by `(contract, event)`; each key carries an
//! [`AbiEvent`] used to decode matching logs into named JSON fields.
//!
//! # EVM ABI indexed-parameter encoding rules
//! Value types (uint, int, bool, address, bytes1-bytes32) are stored in the
//! topic directly and can be recovered. Reference types (string, bytes,
//! arrays, tuples) are stored as the keccak256 of their encoding — the
//! original value is unrecoverable, so they decode to the raw 32-byte hash.

use alloy_dyn_abi::{DynSolValue, EventExt};
use alloy_json_abi::Event;
use alloy_primitives::B256;
use serde_json::{json, Map, Value};
use tiny_keccak::{Hasher, Keccak};

use crate::error::CoreError;
use crate::types::Log;

/// A decodable event of a named contract.
#[derive(Debug, Clone)]
pub struct AbiEvent {
    pub contract_name: String,
    pub event_name: String,
    /// `0x`-hex keccak256 of the canonical signature; equals `topics[0]` of
    /// matching logs.
    pub selector: String,
    event: Event,
}

impl AbiEvent {
    /// Parse a Solidity event declaration, e.g.
    /// `"Transfer(address indexed from, address indexed to, uint256 value)"`.
    pub fn parse(contract_name: impl Into<String>, declaration: &str) -> Result<Self, CoreError> {
        let event = Event::parse(declaration).map_err(|e| CoreError::Validation(format!(
            "bad event declaration '{declaration}': {e}"
        )))?;
        let selector = format!("0x{}", hex::encode(event.selector()));
        Ok(Self {
            contract_name: contract_name.into(),
            event_name: event.name.clone(),
            selector,
            event,
        })
    }

    /// Decode a log's topics and data into a map of named parameter values.
    pub fn decode_log(&self, log: &Log) -> Result<Value, CoreError> {
        let topics: Vec<B256> = log
            .topics
            .iter()
            .map(|t| parse_word(t))
            .collect::<Result<_, _>>()
            .map_err(|reason| self.decode_error(reason))?;
        let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
            .map_err(|e| self.decode_error(format!("bad data hex: {e}")))?;

        let decoded = self
            .event
            .decode_log_parts(topics, &data)
            .map_err(|e| self.decode_error(e.to_string()))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut params = Map::new();
        for (i, input) in self.event.inputs.iter().enumerate() {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            }
            .ok_or_else(|| self.decode_error(format!("missing value for param {i}")))?;
            let name = if input.name.is_empty() {
                format!("arg{i}")
            } else {
                input.name.clone()
            };
            params.insert(name, sol_value_to_json(value));
        }
        Ok(Value::Object(params))
    }

    fn decode_error(&self, reason: impl Into<String>) -> CoreError {
        CoreError::AbiDecode {
            event: format!("{}:{}", self.contract_name, self.event_name),
            reason: reason.into(),
        }
    }
}

fn parse_word(s: &str) -> Result<B256, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|e| format!("bad topic hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("topic is {} bytes, expected 32", bytes.len()));
    }
    Ok(B256::from_slice(&bytes))
}

/// Lower a decoded Solidity value into JSON. Integers become decimal
/// strings so 256-bit values survive without precision loss.
fn sol_value_to_json(value: DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Int(v, _) => json!(v.to_string()),
        DynSolValue::Uint(v, _) => json!(v.to_string()),
        DynSolValue::Address(a) => json!(format!("0x{}", hex::encode(a))),
        DynSolValue::Function(f) => json!(format!("0x{}", hex::encode(f))),
        DynSolValue::FixedBytes(word, size) => {
            json!(format!("0x{}", hex::encode(&word[..size])))
        }
        DynSolValue::Bytes(bytes) => json!(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => {
            Value::Array(values.into_iter().map(sol_value_to_json).collect())
        }
        DynSolValue::Tuple(values) => {
            Value::Array(values.into_iter().map(sol_value_to_json).collect())
        }
    }
}

/// keccak256 of a canonical signature string, as `0x`-hex.
///
/// For raw logs `topics[0]` already *is* the selector; this is for deriving
/// selectors from configured signatures.
pub fn keccak256_signature(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}
