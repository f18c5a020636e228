//! Error types for the Fanlock session engine.
//!
//! Strongly-typed errors for every layer: ratchet state evolution, session
//! lifecycle, device trust, fan-out, and serialization boundaries.
//!
//! The engine never silently substitutes a default key or skips a counter -
//! every failure carries enough context for the calling layer to present a
//! "message could not be sent/read" condition with a typed reason, and for
//! an external retry policy to classify it.

use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No ratchet state exists under this session id
    #[error("session not found: {session_id:#018x}")]
    SessionNotFound {
        /// Session id that was looked up
        session_id: u64,
    },

    /// A key-material capability call failed
    #[error("key generation failed: {reason}")]
    KeyGenerationFailed {
        /// What the capability layer reported
        reason: String,
    },

    /// AEAD authentication failed for a message
    #[error("decryption failed at message index {message_index}")]
    DecryptionFailed {
        /// Chain index of the message that failed to decrypt
        message_index: u32,
    },

    /// An incoming message is further ahead of the receive counter than the
    /// skipped-key window allows
    #[error("too many skipped messages: at {current}, requested {requested} (max skip {max})")]
    TooManySkippedMessages {
        /// Current receive counter
        current: u32,
        /// Index the incoming message carried
        requested: u32,
        /// Skip window bound
        max: u32,
    },

    /// No device record exists under this device id
    #[error("device not found: {device_id:#018x}")]
    DeviceNotFound {
        /// Device id that was looked up
        device_id: u64,
    },

    /// A user already has the maximum number of registered devices
    #[error("device limit reached for user {user_id}: max {max}")]
    DeviceLimitReached {
        /// User whose registration was rejected
        user_id: u64,
        /// Configured device cap
        max: usize,
    },

    /// The device exists but is not trusted for this operation
    #[error("device not trusted: {device_id:#018x}")]
    DeviceNotTrusted {
        /// Device that failed the trust check
        device_id: u64,
    },

    /// A verification response arrived with no challenge outstanding
    #[error("no pending challenge for device {device_id:#018x}")]
    NoPendingChallenge {
        /// Device the response was for
        device_id: u64,
    },

    /// The message timestamp is older than the replay window allows
    #[error("message too old: sent at {sent_at_ms}, limit {age_limit_ms}ms")]
    MessageTooOld {
        /// Sender timestamp from the envelope
        sent_at_ms: u64,
        /// Maximum accepted age
        age_limit_ms: u64,
    },

    /// The message timestamp is ahead of the local clock beyond the
    /// tolerated skew
    #[error("message from future: sent at {sent_at_ms}, local clock {now_ms}")]
    MessageFromFuture {
        /// Sender timestamp from the envelope
        sent_at_ms: u64,
        /// Local clock when the message was checked
        now_ms: u64,
    },

    /// Revocation was attempted against the device the context runs as
    #[error("cannot revoke the current device {device_id:#018x}")]
    CannotRevokeCurrentDevice {
        /// Device that was refused
        device_id: u64,
    },

    /// A fan-out payload carries no entry for this device
    #[error("message not encrypted for device {device_id:#018x}")]
    NotEncryptedForDevice {
        /// Device that tried to decrypt
        device_id: u64,
    },

    /// No active session exists with this device in the conversation
    #[error("no session with device {device_id:#018x}")]
    NoSessionWithDevice {
        /// Peer device without a session
        device_id: u64,
    },

    /// Establishment for this session is reserved but not yet completed
    #[error("establishment pending for session {session_id:#018x}")]
    EstablishmentPending {
        /// Reserved session id
        session_id: u64,
    },

    /// Wire or snapshot encoding/decoding failed
    #[error("encoding error: {reason}")]
    Encoding {
        /// What went wrong
        reason: String,
    },

    /// Persistent store operation failed
    #[error("storage error: {reason}")]
    Storage {
        /// What the backend reported
        reason: String,
    },

    /// A transport delivery failed
    #[error("transport failed: {reason}")]
    TransportFailed {
        /// What the transport reported
        reason: String,
    },
}

impl EngineError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Pending establishments resolve once the first caller completes, and
    /// future-dated messages become valid as clocks converge. Everything
    /// else - cryptographic failures, lookup misses, limit violations - is
    /// never transient and must propagate to the caller's retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EstablishmentPending { .. }
                | Self::MessageFromFuture { .. }
                | Self::Storage { .. }
                | Self::TransportFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_and_skew_errors_are_transient() {
        assert!(EngineError::EstablishmentPending { session_id: 1 }.is_transient());
        assert!(EngineError::MessageFromFuture { sent_at_ms: 10, now_ms: 5 }.is_transient());
        assert!(EngineError::Storage { reason: "io".into() }.is_transient());
    }

    #[test]
    fn cryptographic_failures_are_fatal() {
        assert!(!EngineError::DecryptionFailed { message_index: 3 }.is_transient());
        assert!(
            !EngineError::TooManySkippedMessages { current: 0, requested: 2000, max: 1000 }
                .is_transient()
        );
        assert!(!EngineError::KeyGenerationFailed { reason: "rng".into() }.is_transient());
        assert!(!EngineError::DeviceLimitReached { user_id: 1, max: 10 }.is_transient());
    }
}
