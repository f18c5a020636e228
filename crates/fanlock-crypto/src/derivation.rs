//! Root-key derivation and verification digests.
//!
//! The root KDF is the asymmetric half of the Double Ratchet: every DH
//! ratchet step feeds the current root key and fresh DH output through
//! HKDF-SHA256, yielding the next root key and a new chain key. Labels
//! provide domain separation from all other HKDF uses.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::ratchet::{ChainKey, RootKey};

/// Info label for the root-key step.
const ROOT_STEP_INFO: &[u8] = b"fanlock root step v1";

/// Domain label for device verification digests.
const CHALLENGE_LABEL: &[u8] = b"fanlock trust challenge v1";

/// One root-key step: `(root, dh_output) -> (new_root, chain_key)`.
///
/// The current root key salts the HKDF extraction; the DH output is the
/// input key material. 64 bytes of output split into the new root key and
/// the initial key of a fresh chain.
pub fn kdf_root(root: &RootKey, dh_output: &[u8; 32]) -> (RootKey, ChainKey) {
    let hkdf = Hkdf::<Sha256>::new(Some(root.as_bytes()), dh_output);

    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_STEP_INFO, &mut okm) else {
        unreachable!("64 bytes is within the HKDF-SHA256 output limit");
    };

    let mut root_bytes = [0u8; 32];
    let mut chain_bytes = [0u8; 32];
    root_bytes.copy_from_slice(&okm[..32]);
    chain_bytes.copy_from_slice(&okm[32..]);
    okm.zeroize();

    (RootKey::from_bytes(root_bytes), ChainKey::new(chain_bytes))
}

/// Digest binding a verification challenge nonce to a device public key.
///
/// Used by numeric-code style verification flows where the device proves
/// knowledge of the digest rather than producing a signature.
pub fn challenge_digest(nonce: &[u8; 32], device_public: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(CHALLENGE_LABEL);
    hasher.update(nonce);
    hasher.update(device_public);
    hasher.finalize().into()
}
