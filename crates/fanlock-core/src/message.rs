//! Wire model: identifiers, headers, envelopes, and fan-out payloads.
//!
//! Everything that crosses a process boundary is a serde type encoded as
//! CBOR behind a one-byte format version. Inbound bytes with an unknown
//! version are rejected before deserialization.
//!
//! Identifiers are plain integers; composite lookups always go through
//! structured key types (never formatted strings) so two id spaces can
//! never collide.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::EngineError;

/// Conversation identifier.
pub type ConversationId = u128;

/// User identifier.
pub type UserId = u64;

/// Device identifier.
pub type DeviceId = u64;

/// Session identifier. Allocated locally; each side of a conversation
/// names the shared ratchet by its own id.
pub type SessionId = u64;

/// Fan-out message identifier.
pub type MessageId = u128;

/// Format version written ahead of every CBOR payload.
pub const WIRE_VERSION: u8 = 1;

/// Composite key naming one ratchet session: the conversation plus the
/// remote (user, device) pair the local device talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Conversation the session belongs to
    pub conversation_id: ConversationId,
    /// Remote user
    pub user_id: UserId,
    /// Remote device
    pub device_id: DeviceId,
}

impl SessionKey {
    /// Build a session key.
    pub fn new(conversation_id: ConversationId, user_id: UserId, device_id: DeviceId) -> Self {
        Self { conversation_id, user_id, device_id }
    }
}

/// Ratchet message header, sent in the clear alongside each ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_public: [u8; 32],
    /// Length of the sender's previous sending chain (`PN`)
    pub previous_chain_len: u32,
    /// Index of this message in the current sending chain (`N`)
    pub index: u32,
}

/// AEAD output for one message: transmitted nonce plus ciphertext
/// (including the 16-byte Poly1305 tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBody {
    /// 24-byte `XChaCha20` nonce used for this message
    pub nonce: [u8; 24],
    /// Ciphertext including the authentication tag
    pub ciphertext: Vec<u8>,
}

/// A ratchet message, tagged by its role in the session lifecycle.
///
/// The two variants are handled exhaustively everywhere - inbound routing
/// never sniffs fields to guess what a message is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetMessage {
    /// First message(s) of a session, carrying the prekey reference the
    /// sender encapsulated to so the receiver can establish its side.
    Prekey {
        /// Ratchet header
        header: MessageHeader,
        /// Which of the receiver's published prekeys was used
        prekey_id: u32,
        /// Encrypted payload
        body: EncryptedBody,
    },

    /// Ordinary message within an established session.
    Chained {
        /// Ratchet header
        header: MessageHeader,
        /// Encrypted payload
        body: EncryptedBody,
    },
}

impl RatchetMessage {
    /// Header and body, independent of variant.
    pub fn parts(&self) -> (&MessageHeader, &EncryptedBody) {
        match self {
            Self::Prekey { header, body, .. } | Self::Chained { header, body } => (header, body),
        }
    }

    /// True for the establishment variant.
    pub fn is_prekey(&self) -> bool {
        matches!(self, Self::Prekey { .. })
    }
}

/// Transport envelope around one ratchet message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-assigned session id. Binds the nonce to the sender's state;
    /// receivers route by their own session handle, not this field.
    pub session_id: SessionId,
    /// Sender wall-clock timestamp (Unix ms), checked against the
    /// replay/skew window on receipt
    pub sent_at_ms: u64,
    /// The ratchet message itself
    pub message: RatchetMessage,
}

impl Envelope {
    /// Encode as version-tagged CBOR.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        encode_versioned(self)
    }

    /// Decode from version-tagged CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        decode_versioned(bytes)
    }
}

/// One fan-out send: the same logical message encrypted independently for
/// every reachable device of the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutMessage {
    /// Unique id for this logical message
    pub message_id: MessageId,
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Sending user
    pub sender_user: UserId,
    /// Sending device
    pub sender_device: DeviceId,
    /// Sender wall-clock timestamp (Unix ms)
    pub sent_at_ms: u64,
    /// Per-device ciphertexts, keyed by target device id. Devices that
    /// failed encryption are absent - partial population is expected.
    pub per_device: std::collections::HashMap<DeviceId, Envelope>,
}

impl FanoutMessage {
    /// Encode as version-tagged CBOR.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        encode_versioned(self)
    }

    /// Decode from version-tagged CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        decode_versioned(bytes)
    }
}

/// One session a companion device should provision for itself, carried
/// in a [`KeySyncNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySyncEntry {
    /// Conversation the session belongs to
    pub conversation_id: ConversationId,
    /// Peer user on the other end of the session
    pub peer_user: UserId,
    /// Peer device on the other end of the session
    pub peer_device: DeviceId,
    /// The peer device's published prekey, when the sender's registry
    /// knows it. The companion establishes against this key.
    pub peer_prekey_public: Option<[u8; 32]>,
}

/// Key-synchronization notice delivered to a trusted companion device.
///
/// Sent when a device passes verification and on every maintenance
/// sweep. Each entry carries enough material for the companion to
/// reserve and establish its own pairwise session with the same peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySyncNotice {
    /// User the devices belong to
    pub user_id: UserId,
    /// Device this notice targets
    pub device_id: DeviceId,
    /// Sessions the device should provision
    pub sessions: Vec<KeySyncEntry>,
    /// When this notice was issued (Unix ms)
    pub issued_at_ms: u64,
}

/// Encode a value as CBOR prefixed with [`WIRE_VERSION`].
pub fn encode_versioned<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    let mut buf = vec![WIRE_VERSION];
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| EngineError::Encoding { reason: e.to_string() })?;
    Ok(buf)
}

/// Decode a [`WIRE_VERSION`]-prefixed CBOR value.
pub fn decode_versioned<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    let Some((&version, rest)) = bytes.split_first() else {
        return Err(EngineError::Encoding { reason: "empty payload".to_string() });
    };

    if version != WIRE_VERSION {
        return Err(EngineError::Encoding {
            reason: format!("unsupported format version {version}, expected {WIRE_VERSION}"),
        });
    }

    ciborium::from_reader(rest).map_err(|e| EngineError::Encoding { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            session_id: 0xDEAD_BEEF,
            sent_at_ms: 1_700_000_000_000,
            message: RatchetMessage::Chained {
                header: MessageHeader {
                    ratchet_public: [7u8; 32],
                    previous_chain_len: 4,
                    index: 9,
                },
                body: EncryptedBody { nonce: [1u8; 24], ciphertext: vec![2, 3, 4] },
            },
        }
    }

    #[test]
    fn envelope_roundtrips_through_cbor() {
        let envelope = sample_envelope();
        let bytes = envelope.encode().unwrap();

        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = sample_envelope().encode().unwrap();
        bytes[0] = 99;

        let result = Envelope::decode(&bytes);
        assert!(matches!(result, Err(EngineError::Encoding { .. })));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(Envelope::decode(&[]), Err(EngineError::Encoding { .. })));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = sample_envelope().encode().unwrap();
        let result = Envelope::decode(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(EngineError::Encoding { .. })));
    }

    #[test]
    fn prekey_and_chained_share_parts_access() {
        let header =
            MessageHeader { ratchet_public: [0u8; 32], previous_chain_len: 0, index: 0 };
        let body = EncryptedBody { nonce: [0u8; 24], ciphertext: vec![] };

        let prekey =
            RatchetMessage::Prekey { header, prekey_id: 3, body: body.clone() };
        let chained = RatchetMessage::Chained { header, body };

        assert!(prekey.is_prekey());
        assert!(!chained.is_prekey());
        assert_eq!(prekey.parts().0, chained.parts().0);
    }

    #[test]
    fn fanout_message_roundtrips() {
        let mut per_device = std::collections::HashMap::new();
        per_device.insert(5u64, sample_envelope());

        let fanout = FanoutMessage {
            message_id: 1,
            conversation_id: 2,
            sender_user: 3,
            sender_device: 4,
            sent_at_ms: 5,
            per_device,
        };

        let bytes = fanout.encode().unwrap();
        assert_eq!(FanoutMessage::decode(&bytes).unwrap(), fanout);
    }

    #[test]
    fn session_keys_are_structural() {
        // (1, 23) vs (12, 3) would collide under string concatenation
        let a = SessionKey::new(0, 1, 23);
        let b = SessionKey::new(0, 12, 3);
        assert_ne!(a, b);
    }
}
