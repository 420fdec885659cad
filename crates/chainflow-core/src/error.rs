//! Error types shared across the chainflow crates.

use thiserror::Error;

/// Errors produced while decoding or validating chain data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A log could not be decoded against the declared ABI event.
    #[error("ABI decode failed for '{event}': {reason}")]
    AbiDecode { event: String, reason: String },

    /// A hex quantity or hash string was malformed.
    #[error("invalid hex value '{value}': {reason}")]
    InvalidHex { value: String, reason: String },

    /// A child-address location string could not be parsed.
    #[error("invalid child address location '{0}'")]
    InvalidChildAddressLocation(String),

    /// Config-time validation failure, surfaced before the engine starts.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    /// Returns `true` if the error is a per-event decode failure.
    ///
    /// Decode failures are logged and the event skipped; they never abort
    /// indexing. Everything else is surfaced to the caller.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::AbiDecode { .. })
    }
}
