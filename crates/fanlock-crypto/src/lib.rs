//! Fanlock Cryptographic Primitives
//!
//! Cryptographic building blocks for the Fanlock session engine. Pure
//! functions and small value types with deterministic outputs. Callers
//! provide random bytes (key seeds, nonce suffixes) for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! Each session holds a Double Ratchet state. The root key advances on every
//! asymmetric (DH) ratchet step, producing a fresh chain key; the chain key
//! advances on every message, producing one-time message keys.
//!
//! ```text
//! Shared Secret (session establishment)
//!        │
//!        ▼
//! HKDF ← DH output → Root Key step (per DH ratchet)
//!        │
//!        ▼
//! Chain Ratchet → Message Keys (per message)
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! Message keys are used for exactly one encryption operation and are
//! discarded (or buffered briefly for out-of-order delivery) after use.
//!
//! # Security
//!
//! Forward Secrecy:
//! - DH ratchet step: new root key invalidates all previous chain keys
//! - Chain advancement: old chain keys are zeroized after deriving the next
//! - Message key disposal: keys are zeroized when dropped
//!
//! Break-in Recovery:
//! - Every inbound public-key change re-keys both the sending and the
//!   receiving direction from fresh DH output
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD provides tamper-proof encryption
//! - Nonce structure binds ciphertext to (session, index, previous chain)
//! - Ed25519 signatures prove device key possession during verification

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod derivation;
mod dh;
mod encryption;
mod error;
mod ratchet;
mod signature;

pub use derivation::{challenge_digest, kdf_root};
pub use dh::{KeyPair, PUBLIC_KEY_SIZE};
pub use encryption::{NONCE_RANDOM_SIZE, NONCE_SIZE, build_nonce, open, seal};
pub use error::CryptoError;
pub use ratchet::{ChainKey, MessageKey, RootKey};
pub use signature::{SIGNATURE_SIZE, SigningIdentity, verify_detached};
