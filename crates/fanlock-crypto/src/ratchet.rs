//! Symmetric chain ratchet for forward-secure message key derivation.
//!
//! # Security Properties
//!
//! - Forward Secrecy: old chain keys are overwritten when advancing
//! - Key Uniqueness: each index produces a unique message key
//! - Determinism: the same chain key always produces the same key sequence

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving a message key from a chain key
const MESSAGE_LABEL: &[u8] = b"fanlock message";

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"fanlock chain";

/// Root key of a Double Ratchet session.
///
/// Advanced only by DH ratchet steps (see [`kdf_root`](crate::kdf_root)).
/// Each step consumes the current root key and DH output and yields a new
/// root key plus a fresh [`ChainKey`].
#[derive(Clone)]
pub struct RootKey {
    key: [u8; 32],
}

impl RootKey {
    /// Wrap 32 bytes of key material as a root key.
    ///
    /// The initial root key of a session is the shared secret from the
    /// establishment handshake.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Raw key bytes. Only for KDF input and state snapshots.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for RootKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKey").finish_non_exhaustive()
    }
}

/// A message key derived from the chain ratchet.
///
/// Used for a single AEAD operation and then discarded, or buffered in the
/// skipped-key window for out-of-order delivery.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    index: u32,
}

impl MessageKey {
    /// Rebuild a message key from snapshot parts.
    pub fn from_parts(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    /// 32-byte symmetric key for XChaCha20-Poly1305.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Position in the chain this key was derived at.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Forward-secure symmetric chain.
///
/// Derives a sequence of message keys from an initial chain key. Each
/// [`advance()`](Self::advance) call:
/// 1. Derives a message key at the current index
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key (forward secrecy)
#[derive(Clone)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    /// Create a fresh chain starting at index 0.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Rebuild a chain from snapshot parts.
    pub fn from_parts(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    /// Index the next derived message key will carry.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Raw key bytes. Only for state snapshots.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Advance the chain and derive the message key at the current index.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.index == u32::MAX {
            return Err(CryptoError::ChainOverflow { current: self.index });
        }

        let message_key = derive(&self.key, MESSAGE_LABEL);
        let next_chain_key = derive(&self.key, CHAIN_LABEL);

        // Zeroize and replace the old chain key for forward secrecy
        self.key.zeroize();
        self.key = next_chain_key;

        let current = self.index;
        self.index = self.index.wrapping_add(1);

        Ok(MessageKey { key: message_key, index: current })
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey").field("index", &self.index).finish_non_exhaustive()
    }
}

fn derive(chain_key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(chain_key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}
