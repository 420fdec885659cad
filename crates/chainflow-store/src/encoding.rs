//! Order-preserving text encoding for 256-bit integer columns.
//!
//! Postgres stores big integers as `NUMERIC(78,0)`. SQLite has no such type,
//! so 256-bit values are stored as fixed-width strings that compare in
//! integer order under lexicographic byte comparison: one sign character
//! followed by 78 zero-padded decimal digits (2^256 - 1 has 78 digits).
//!
//! Negative values store the two's-complement magnitude `2^256 - |v|` behind
//! a `-` prefix: `-` sorts before every digit, and within negatives a more
//! negative value yields a smaller magnitude, so string order equals integer
//! order across the whole i256 range.

use alloy_primitives::{I256, U256};

use crate::StoreError;

const DIGITS: usize = 78;

/// Encode an unsigned 256-bit integer as a 79-char sortable string.
pub fn encode_uint256(value: U256) -> String {
    format!("0{value:0>width$}", width = DIGITS)
}

/// Decode a string produced by [`encode_uint256`].
pub fn decode_uint256(s: &str) -> Result<U256, StoreError> {
    let digits = s
        .strip_prefix('0')
        .ok_or_else(|| StoreError::Encoding(format!("bad uint256 encoding '{s}'")))?;
    U256::from_str_radix(digits, 10)
        .map_err(|e| StoreError::Encoding(format!("bad uint256 encoding '{s}': {e}")))
}

/// Encode a signed 256-bit integer as a 79-char sortable string.
pub fn encode_int256(value: I256) -> String {
    if value.is_negative() {
        // The two's-complement bit pattern is exactly 2^256 - |v|.
        let complement = value.into_raw();
        format!("-{complement:0>width$}", width = DIGITS)
    } else {
        format!("0{value:0>width$}", width = DIGITS)
    }
}

/// Decode a string produced by [`encode_int256`].
pub fn decode_int256(s: &str) -> Result<I256, StoreError> {
    let bad = || StoreError::Encoding(format!("bad int256 encoding '{s}'"));
    let (sign, digits) = (s.get(..1).ok_or_else(bad)?, s.get(1..).ok_or_else(bad)?);
    let raw = U256::from_str_radix(digits, 10).map_err(|_| bad())?;
    match sign {
        "-" => {
            let value = I256::from_raw(raw);
            if value.is_negative() {
                Ok(value)
            } else {
                Err(bad())
            }
        }
        "0" => I256::try_from(raw).map_err(|_| bad()),
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_roundtrip() {
        for v in [U256::ZERO, U256::from(1u64), U256::from(1000u64), U256::MAX] {
            let encoded = encode_uint256(v);
            assert_eq!(encoded.len(), 79);
            assert_eq!(decode_uint256(&encoded).unwrap(), v);
        }
    }

    #[test]
    fn uint_order_preserved() {
        let values = [
            U256::ZERO,
            U256::from(9u64),
            U256::from(10u64),
            U256::from(u64::MAX),
            U256::MAX,
        ];
        let encoded: Vec<String> = values.iter().map(|v| encode_uint256(*v)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn int_roundtrip() {
        for v in [
            I256::MIN,
            I256::try_from(-1_000_000i64).unwrap(),
            I256::MINUS_ONE,
            I256::ZERO,
            I256::ONE,
            I256::try_from(1_000_000i64).unwrap(),
            I256::MAX,
        ] {
            let encoded = encode_int256(v);
            assert_eq!(encoded.len(), 79);
            assert_eq!(decode_int256(&encoded).unwrap(), v, "value {v}");
        }
    }

    #[test]
    fn int_order_preserved() {
        let values = [
            I256::MIN,
            I256::try_from(-500i64).unwrap(),
            I256::MINUS_ONE,
            I256::ZERO,
            I256::ONE,
            I256::try_from(500i64).unwrap(),
            I256::MAX,
        ];
        let encoded: Vec<String> = values.iter().map(|v| encode_int256(*v)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }
}
