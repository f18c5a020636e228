//! X25519 key agreement for the DH ratchet.
//!
//! Key pairs are constructed from caller-provided 32-byte seeds so that the
//! engine's environment abstraction controls all entropy. Public keys cross
//! module boundaries as plain `[u8; 32]` arrays; secrets stay inside
//! [`KeyPair`] and are zeroized on drop by the underlying dalek types.

use x25519_dalek::{PublicKey, StaticSecret};

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 key pair used as a ratchet key.
///
/// One pair exists per ratchet state; a fresh pair is generated on every DH
/// ratchet step and on proactive rotation.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from a 32-byte seed.
    ///
    /// The seed is clamped per the X25519 specification, so any 32 random
    /// bytes form a valid secret.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half of the pair as raw bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Secret half as raw bytes. Only for state snapshots.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Diffie-Hellman agreement with a peer's public key.
    pub fn agree(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret half
        f.debug_struct("KeyPair").field("public", &self.public_bytes()).finish_non_exhaustive()
    }
}
