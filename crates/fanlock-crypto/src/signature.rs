//! Ed25519 device identity signatures.
//!
//! Every registered device carries an Ed25519 identity generated at
//! registration. Trust challenges are answered with a detached signature
//! over the challenge nonce, proving possession of the identity secret.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::CryptoError;

/// Size of a detached Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 signing identity for one device.
#[derive(Clone)]
pub struct SigningIdentity {
    signing: SigningKey,
}

impl SigningIdentity {
    /// Build an identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// Public verification key as raw bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Secret seed as raw bytes. Only for handing the identity to its
    /// owning device once, at registration.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Produce a detached signature over a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity").field("public", &self.public_bytes()).finish_non_exhaustive()
    }
}

/// Verify a detached signature against a raw public key.
///
/// Returns `false` for a valid-length signature that does not verify.
///
/// # Errors
///
/// - [`CryptoError::MalformedSignature`] when the signature has the wrong
///   length.
/// - [`CryptoError::InvalidKey`] when the public key bytes do not decode as
///   a curve point.
pub fn verify_detached(
    public: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature.try_into().map_err(|_| {
        CryptoError::MalformedSignature { expected: SIGNATURE_SIZE, actual: signature.len() }
    })?;

    let verifying = VerifyingKey::from_bytes(public)
        .map_err(|_| CryptoError::InvalidKey { reason: "not a valid Ed25519 point" })?;

    Ok(verifying.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok())
}
