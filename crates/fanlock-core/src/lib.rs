//! Fanlock Session Engine
//!
//! Forward-secret messaging sessions for multi-device conversations,
//! built on the Double Ratchet. Every (conversation, local device, remote
//! device) pair gets an independent ratchet session; one logical message
//! fans out as independent ciphertexts to every device of the recipient.
//!
//! # Architecture
//!
//! ```text
//! MessagingContext (one per user+device, explicit lifecycle)
//!        │
//!        ├── SessionDirectory ── RatchetEngine ── RatchetState (per peer device)
//!        │        │
//!        │        └── at-most-once establishment table
//!        │
//!        ├── DeviceRegistry ── trust challenges, revocation
//!        │
//!        └── MaintenanceScheduler ── key sync / heartbeat / cleanup loops
//! ```
//!
//! # Determinism
//!
//! All time and randomness flow through the [`Environment`] trait. The
//! production [`SystemEnv`] uses the system clock and OS entropy; tests
//! use [`env::test_utils::MockEnv`] with a virtual clock and seeded RNG,
//! so every sweep and expiry is tickable by hand.
//!
//! # Boundaries
//!
//! The engine does no I/O. Network delivery goes through the
//! [`Transport`] trait with already-encrypted payloads; persistence goes
//! through the [`PersistentStore`] blob trait with versioned CBOR
//! snapshots the engine encodes itself.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod context;
pub mod devices;
pub mod directory;
pub mod env;
pub mod error;
pub mod maintenance;
pub mod message;
pub mod ratchet;
pub mod storage;
pub mod transport;

pub use context::{Fanout, MessagingContext};
pub use devices::{
    ChallengeKind, DeviceRecord, DeviceRegistry, DeviceStatus, MAX_DEVICES, RegisteredDevice,
    RegistryConfig, TrustChallenge,
};
pub use directory::{
    DirectoryConfig, Established, SessionDirectory, SessionInfo, VerificationStatus,
};
pub use env::{Environment, SystemEnv};
pub use error::EngineError;
pub use maintenance::{MaintenanceConfig, MaintenanceScheduler};
pub use message::{
    ConversationId, DeviceId, EncryptedBody, Envelope, FanoutMessage, KeySyncEntry,
    KeySyncNotice, MessageHeader, MessageId, RatchetMessage, SessionId, SessionKey, UserId,
    WIRE_VERSION,
};
pub use ratchet::{MAX_SKIP, RatchetCounters, RatchetEngine, RatchetSnapshot};
pub use storage::{MemoryStore, PersistentStore};
pub use transport::{ChannelTransport, DeliveryAck, NullTransport, Transport};
