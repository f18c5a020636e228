//! Message encryption using `XChaCha20-Poly1305`.
//!
//! All functions are pure - random bytes must be provided by the caller.
//! This enables deterministic testing and keeps entropy behind the engine's
//! environment abstraction.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};

use crate::{error::CryptoError, ratchet::MessageKey};

/// Size of the full `XChaCha20` nonce (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Size of the random suffix in the nonce (8 bytes).
pub const NONCE_RANDOM_SIZE: usize = 8;

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-7: session id (big-endian)
/// - bytes 8-11: message index (big-endian)
/// - bytes 12-15: previous chain length (big-endian)
/// - bytes 16-23: random suffix (caller-provided)
///
/// The structured prefix makes the nonce unique per (session, chain,
/// index); the random suffix keeps it unique even across a restored
/// snapshot replaying a counter.
pub fn build_nonce(
    session_id: u64,
    message_index: u32,
    previous_chain_len: u32,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];

    nonce[0..8].copy_from_slice(&session_id.to_be_bytes());
    nonce[8..12].copy_from_slice(&message_index.to_be_bytes());
    nonce[12..16].copy_from_slice(&previous_chain_len.to_be_bytes());
    nonce[16..24].copy_from_slice(&random_suffix);

    nonce
}

/// Encrypt plaintext under a one-time message key.
///
/// The returned ciphertext includes the 16-byte Poly1305 tag.
pub fn seal(key: &MessageKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.key().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Decrypt ciphertext under a one-time message key.
///
/// # Errors
///
/// - [`CryptoError::TagMismatch`] when the authentication tag does not
///   verify (tampering or wrong key). Distinct from every other failure so
///   callers can surface it as a decryption error with context.
pub fn open(
    key: &MessageKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.key().into());

    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::TagMismatch)
}
