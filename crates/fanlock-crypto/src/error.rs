//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors surfaced by the primitive layer.
///
/// These are deliberately coarse: callers map them onto the engine's error
/// taxonomy at the boundary, attaching session and message context there.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A key could not be constructed from the provided bytes.
    #[error("invalid key material: {reason}")]
    InvalidKey {
        /// What was wrong with the input
        reason: &'static str,
    },

    /// AEAD authentication failed (tampering or wrong key).
    #[error("decryption failed: authentication tag mismatch")]
    TagMismatch,

    /// A chain ratchet hit its counter ceiling.
    #[error("chain counter overflow at index {current}")]
    ChainOverflow {
        /// Index the chain was at when the overflow was detected
        current: u32,
    },

    /// A signature did not parse as a valid Ed25519 signature.
    #[error("malformed signature: expected {expected} bytes, got {actual}")]
    MalformedSignature {
        /// Required signature length
        expected: usize,
        /// Length actually provided
        actual: usize,
    },
}
