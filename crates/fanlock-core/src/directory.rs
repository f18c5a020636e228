//! Session lifecycle: establishment, bookkeeping, expiry.
//!
//! The directory owns the [`RatchetEngine`] and everything around it:
//! which sessions exist, their statistics, and the in-flight establishment
//! table that makes session creation at-most-once. Racing callers for the
//! same (conversation, user, device) key observe one reserved session id
//! and exactly one ratchet state is ever created.

use std::{collections::HashMap, time::Duration};

use fanlock_crypto::KeyPair;
use serde::{Deserialize, Serialize};

use crate::{
    env::Environment,
    error::EngineError,
    message::{
        ConversationId, DeviceId, Envelope, SessionId, SessionKey, UserId, decode_versioned,
        encode_versioned,
    },
    ratchet::{RatchetEngine, RatchetSnapshot},
    storage::{PersistentStore, directory_key, session_key},
};

/// Device id used when an establishment names no specific device.
const DEFAULT_DEVICE: DeviceId = 0;

/// Tuning knobs for session lifecycle.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Inactivity window after which a session is evicted
    pub session_timeout: Duration,
    /// Proactive rotation cadence, in sent messages. Zero disables.
    pub rotation_interval: u64,
    /// How far ahead of the local clock an inbound timestamp may be
    pub max_clock_skew: Duration,
    /// Oldest inbound timestamp accepted
    pub max_message_age: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30 * 24 * 60 * 60),
            rotation_interval: 100,
            max_clock_skew: Duration::from_secs(5 * 60),
            max_message_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// How far the peer behind a session has been verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    /// No verification has happened
    Unverified,
    /// Peer device passed a trust challenge
    Verified,
    /// Explicitly trusted by the user
    Trusted,
}

/// Bookkeeping for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id in the engine
    pub session_id: SessionId,
    /// When the session was established (Unix ms)
    pub established_at_ms: u64,
    /// Last send or receive (Unix ms)
    pub last_activity_ms: u64,
    /// Messages sent through this session
    pub messages_sent: u64,
    /// Messages received through this session
    pub messages_received: u64,
    /// Proactive rotations performed
    pub rotations: u32,
    /// Verification state of the peer device
    pub verification: VerificationStatus,
    /// False once closed; evicted by the next cleanup
    pub active: bool,
}

/// Result of an establishment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Established {
    /// The session id, active or reserved
    pub session_id: SessionId,
    /// True when this call reserved the id
    pub is_new: bool,
    /// True until the peer device has been verified
    pub requires_verification: bool,
}

/// Serializable directory state, minus the in-flight table.
///
/// Pending establishments are deliberately not persisted: a reservation
/// only means something to the caller that raced for it in this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectoryBlob {
    infos: Vec<(SessionKey, SessionInfo)>,
}

/// Owns the ratchet engine and all session bookkeeping.
pub struct SessionDirectory<E: Environment> {
    env: E,
    config: DirectoryConfig,
    engine: RatchetEngine<E>,
    infos: HashMap<SessionKey, SessionInfo>,
    by_id: HashMap<SessionId, SessionKey>,
    pending: HashMap<SessionKey, SessionId>,
}

impl<E: Environment> SessionDirectory<E> {
    /// Create an empty directory.
    pub fn new(env: E, config: DirectoryConfig) -> Self {
        let engine = RatchetEngine::new(env.clone());
        Self { env, config, engine, infos: HashMap::new(), by_id: HashMap::new(), pending: HashMap::new() }
    }

    fn allocate_session_id(&self) -> SessionId {
        loop {
            let candidate = self.env.random_u64();
            let reserved = self.pending.values().any(|&id| id == candidate);
            if !reserved && !self.by_id.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Request a session with a peer device.
    ///
    /// An active session is returned unchanged. A pending establishment
    /// returns the same reserved id as the first caller, so concurrent
    /// callers never create divergent ratchet states. Otherwise a fresh id
    /// is reserved; the caller runs the handshake and finishes with
    /// [`complete_establishment`](Self::complete_establishment).
    pub fn establish(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        device_id: Option<DeviceId>,
    ) -> Established {
        let key =
            SessionKey::new(conversation_id, user_id, device_id.unwrap_or(DEFAULT_DEVICE));

        if let Some(info) = self.infos.get(&key) {
            if info.active {
                return Established {
                    session_id: info.session_id,
                    is_new: false,
                    requires_verification: info.verification == VerificationStatus::Unverified,
                };
            }
        }

        if let Some(&session_id) = self.pending.get(&key) {
            return Established { session_id, is_new: false, requires_verification: true };
        }

        let session_id = self.allocate_session_id();
        self.pending.insert(key, session_id);
        tracing::debug!(session_id, conversation_id, user_id, "reserved session establishment");
        Established { session_id, is_new: true, requires_verification: true }
    }

    /// Finish a sender-side establishment under the reserved id.
    ///
    /// Idempotent against completed work: if the session is already
    /// active its id is returned and nothing changes. Without a prior
    /// reservation one is taken implicitly.
    pub fn complete_establishment(
        &mut self,
        key: SessionKey,
        local_device: DeviceId,
        remote_public: [u8; 32],
        shared_secret: [u8; 32],
        prekey_id: u32,
    ) -> Result<SessionId, EngineError> {
        if let Some(info) = self.infos.get(&key) {
            if info.active {
                return Ok(info.session_id);
            }
        }

        let session_id = match self.pending.get(&key) {
            Some(&reserved) => reserved,
            None => {
                let id = self.allocate_session_id();
                self.pending.insert(key, id);
                id
            }
        };

        self.engine.initialize_as_sender(
            session_id,
            key.conversation_id,
            local_device,
            key.device_id,
            remote_public,
            shared_secret,
            prekey_id,
        )?;

        self.pending.remove(&key);
        self.insert_info(key, session_id);
        tracing::info!(session_id, conversation_id = key.conversation_id, "session established");
        Ok(session_id)
    }

    /// Receiver-side establishment from a peer's first envelope.
    ///
    /// `key` names the sender: (conversation, sender user, sender device).
    /// Uses the same reservation table as [`establish`](Self::establish).
    /// On failure the reservation is released and no session exists.
    pub fn accept_inbound(
        &mut self,
        key: SessionKey,
        local_device: DeviceId,
        shared_secret: [u8; 32],
        local_prekey: KeyPair,
        envelope: &Envelope,
    ) -> Result<(SessionId, Vec<u8>), EngineError> {
        if let Some(info) = self.infos.get(&key) {
            if info.active {
                let session_id = info.session_id;
                let plaintext = self.receive_message(session_id, envelope)?;
                return Ok((session_id, plaintext));
            }
        }

        self.check_envelope_time(envelope)?;

        let session_id = match self.pending.get(&key) {
            Some(&reserved) => reserved,
            None => {
                let id = self.allocate_session_id();
                self.pending.insert(key, id);
                id
            }
        };

        match self.engine.initialize_as_receiver(
            session_id,
            key.conversation_id,
            local_device,
            key.device_id,
            shared_secret,
            local_prekey,
            envelope,
        ) {
            Ok(plaintext) => {
                self.pending.remove(&key);
                self.insert_info(key, session_id);
                if let Some(info) = self.infos.get_mut(&key) {
                    info.messages_received = 1;
                }
                tracing::info!(
                    session_id,
                    conversation_id = key.conversation_id,
                    "inbound session established"
                );
                Ok((session_id, plaintext))
            }
            Err(e) => {
                self.pending.remove(&key);
                Err(e)
            }
        }
    }

    fn insert_info(&mut self, key: SessionKey, session_id: SessionId) {
        let now_ms = self.env.now_ms();
        self.infos.insert(
            key,
            SessionInfo {
                session_id,
                established_at_ms: now_ms,
                last_activity_ms: now_ms,
                messages_sent: 0,
                messages_received: 0,
                rotations: 0,
                verification: VerificationStatus::Unverified,
                active: true,
            },
        );
        self.by_id.insert(session_id, key);
    }

    /// Encrypt and record a send, rotating on the configured cadence.
    pub fn send_message(
        &mut self,
        session_id: SessionId,
        plaintext: &[u8],
    ) -> Result<Envelope, EngineError> {
        let key = self.active_key(session_id)?;
        let envelope = self.engine.encrypt(session_id, plaintext)?;

        let now_ms = self.env.now_ms();
        let interval = self.config.rotation_interval;
        let mut rotate = false;
        if let Some(info) = self.infos.get_mut(&key) {
            info.messages_sent += 1;
            info.last_activity_ms = now_ms;
            rotate = interval > 0 && info.messages_sent % interval == 0;
        }

        if rotate && self.engine.rotate(session_id)? {
            if let Some(info) = self.infos.get_mut(&key) {
                info.rotations += 1;
            }
        }

        Ok(envelope)
    }

    /// Decrypt and record a receive, enforcing the replay/skew window.
    pub fn receive_message(
        &mut self,
        session_id: SessionId,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, EngineError> {
        let key = self.active_key(session_id)?;
        self.check_envelope_time(envelope)?;

        let plaintext = self.engine.decrypt(session_id, envelope)?;

        let now_ms = self.env.now_ms();
        if let Some(info) = self.infos.get_mut(&key) {
            info.messages_received += 1;
            info.last_activity_ms = now_ms;
        }
        Ok(plaintext)
    }

    fn active_key(&self, session_id: SessionId) -> Result<SessionKey, EngineError> {
        let Some(key) = self.by_id.get(&session_id).copied() else {
            if self.pending.values().any(|&id| id == session_id) {
                return Err(EngineError::EstablishmentPending { session_id });
            }
            return Err(EngineError::SessionNotFound { session_id });
        };
        match self.infos.get(&key) {
            Some(info) if info.active => Ok(key),
            _ => Err(EngineError::SessionNotFound { session_id }),
        }
    }

    fn check_envelope_time(&self, envelope: &Envelope) -> Result<(), EngineError> {
        let now_ms = self.env.now_ms();
        let skew_ms = self.config.max_clock_skew.as_millis() as u64;
        let age_ms = self.config.max_message_age.as_millis() as u64;

        if envelope.sent_at_ms > now_ms.saturating_add(skew_ms) {
            return Err(EngineError::MessageFromFuture { sent_at_ms: envelope.sent_at_ms, now_ms });
        }
        if now_ms.saturating_sub(envelope.sent_at_ms) > age_ms {
            return Err(EngineError::MessageTooOld {
                sent_at_ms: envelope.sent_at_ms,
                age_limit_ms: age_ms,
            });
        }
        Ok(())
    }

    /// Deactivate a session and discard its key material.
    ///
    /// Bookkeeping stays until the next cleanup sweep evicts it.
    pub fn close_session(&mut self, session_id: SessionId) -> Result<(), EngineError> {
        let key = self.active_key(session_id)?;
        if let Some(info) = self.infos.get_mut(&key) {
            info.active = false;
        }
        self.engine.remove_session(session_id);
        tracing::debug!(session_id, "session closed");
        Ok(())
    }

    /// Evict closed sessions and sessions inactive beyond the timeout.
    ///
    /// Returns the evicted ids.
    pub fn cleanup_expired(&mut self) -> Vec<SessionId> {
        let now_ms = self.env.now_ms();
        let timeout_ms = self.config.session_timeout.as_millis() as u64;

        let expired: Vec<(SessionKey, SessionId)> = self
            .infos
            .iter()
            .filter(|(_, info)| {
                !info.active || now_ms.saturating_sub(info.last_activity_ms) > timeout_ms
            })
            .map(|(&key, info)| (key, info.session_id))
            .collect();

        for &(key, session_id) in &expired {
            self.engine.remove_session(session_id);
            self.infos.remove(&key);
            self.by_id.remove(&session_id);
            tracing::debug!(session_id, "session evicted");
        }

        expired.into_iter().map(|(_, id)| id).collect()
    }

    /// Rotate every active session shared with a user.
    ///
    /// The revocation path: after a device is revoked, keys it may have
    /// cached must stop decrypting new traffic. Sessions where rotation
    /// cannot apply yet (the peer has never replied, or a refresh is
    /// already outstanding) are skipped; only rotations that actually
    /// happened are counted and returned.
    pub fn rotate_for_user(&mut self, user_id: UserId) -> Result<usize, EngineError> {
        let targets: Vec<(SessionKey, SessionId)> = self
            .infos
            .iter()
            .filter(|(key, info)| key.user_id == user_id && info.active)
            .map(|(&key, info)| (key, info.session_id))
            .collect();

        let mut applied = 0;
        for &(key, session_id) in &targets {
            if self.engine.rotate(session_id)? {
                if let Some(info) = self.infos.get_mut(&key) {
                    info.rotations += 1;
                }
                applied += 1;
            }
        }

        tracing::info!(user_id, sessions = targets.len(), applied, "rotated sessions for user");
        Ok(applied)
    }

    /// Set the verification status of one session.
    pub fn set_verification(
        &mut self,
        session_id: SessionId,
        status: VerificationStatus,
    ) -> Result<(), EngineError> {
        let key = self.active_key(session_id)?;
        if let Some(info) = self.infos.get_mut(&key) {
            info.verification = status;
        }
        Ok(())
    }

    /// Set the verification status of every active session with a peer
    /// device. Returns how many sessions were updated.
    pub fn set_verification_for_device(
        &mut self,
        user_id: UserId,
        device_id: DeviceId,
        status: VerificationStatus,
    ) -> usize {
        let mut updated = 0;
        for (key, info) in &mut self.infos {
            if key.user_id == user_id && key.device_id == device_id && info.active {
                info.verification = status;
                updated += 1;
            }
        }
        updated
    }

    /// Session id under a key, if active.
    pub fn session_for(&self, key: &SessionKey) -> Option<SessionId> {
        self.infos.get(key).filter(|info| info.active).map(|info| info.session_id)
    }

    /// Bookkeeping for a session, if it exists.
    pub fn info(&self, session_id: SessionId) -> Option<&SessionInfo> {
        self.by_id.get(&session_id).and_then(|key| self.infos.get(key))
    }

    /// Keys of every active session.
    pub fn active_sessions(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self
            .infos
            .iter()
            .filter(|(_, info)| info.active)
            .map(|(&key, _)| key)
            .collect();
        keys.sort_unstable_by_key(|key| (key.conversation_id, key.user_id, key.device_id));
        keys
    }

    /// Distinct conversations with at least one active session.
    pub fn active_conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self
            .infos
            .iter()
            .filter(|(_, info)| info.active)
            .map(|(key, _)| key.conversation_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of active sessions.
    pub fn active_count(&self) -> usize {
        self.infos.values().filter(|info| info.active).count()
    }

    /// Number of reserved, uncompleted establishments.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Direct engine access for fan-out and diagnostics.
    pub fn engine(&self) -> &RatchetEngine<E> {
        &self.engine
    }

    /// Persist bookkeeping and every active session's ratchet snapshot.
    pub fn persist(&self, store: &dyn PersistentStore) -> Result<(), EngineError> {
        let blob =
            DirectoryBlob { infos: self.infos.iter().map(|(&k, v)| (k, v.clone())).collect() };
        store.put(&directory_key(), encode_versioned(&blob)?)?;

        for info in self.infos.values().filter(|info| info.active) {
            let snapshot = self.engine.snapshot(info.session_id)?;
            store.put(&session_key(info.session_id), encode_versioned(&snapshot)?)?;
        }
        Ok(())
    }

    /// Rebuild a directory from a store.
    ///
    /// Returns `None` when the store holds no directory blob. Sessions
    /// whose snapshot is missing are dropped from the bookkeeping rather
    /// than resurrected without key material.
    pub fn load(
        env: E,
        config: DirectoryConfig,
        store: &dyn PersistentStore,
    ) -> Result<Option<Self>, EngineError> {
        let Some(bytes) = store.get(&directory_key())? else {
            return Ok(None);
        };
        let blob: DirectoryBlob = decode_versioned(&bytes)?;

        let mut directory = Self::new(env, config);
        for (key, info) in blob.infos {
            if info.active {
                let Some(bytes) = store.get(&session_key(info.session_id))? else {
                    tracing::warn!(
                        session_id = info.session_id,
                        "dropping session with missing snapshot"
                    );
                    continue;
                };
                let snapshot: RatchetSnapshot = decode_versioned(&bytes)?;
                directory.engine.restore(snapshot);
            }
            directory.by_id.insert(info.session_id, key);
            directory.infos.insert(key, info);
        }
        Ok(Some(directory))
    }
}

#[cfg(test)]
mod tests {
    use fanlock_crypto::KeyPair;

    use super::*;
    use crate::{env::test_utils::MockEnv, storage::MemoryStore};

    const CONV: ConversationId = 9;
    const ALICE: UserId = 1;
    const BOB: UserId = 2;
    const ALICE_DEV: DeviceId = 11;
    const BOB_DEV: DeviceId = 21;
    const SHARED: [u8; 32] = [5u8; 32];

    fn directory(seed: u64) -> SessionDirectory<MockEnv> {
        SessionDirectory::new(MockEnv::seeded(seed), DirectoryConfig::default())
    }

    /// Alice's directory talking to Bob's, first message delivered.
    fn established_pair() -> (SessionDirectory<MockEnv>, SessionDirectory<MockEnv>, SessionId, SessionId)
    {
        let mut alice = directory(1);
        let mut bob = directory(2);
        let prekey = KeyPair::from_seed([3u8; 32]);

        let reserved = alice.establish(CONV, BOB, Some(BOB_DEV));
        assert!(reserved.is_new);

        let to_bob = SessionKey::new(CONV, BOB, BOB_DEV);
        let alice_sid = alice
            .complete_establishment(to_bob, ALICE_DEV, prekey.public_bytes(), SHARED, 1)
            .unwrap();
        assert_eq!(alice_sid, reserved.session_id);

        let first = alice.send_message(alice_sid, b"hello").unwrap();

        let from_alice = SessionKey::new(CONV, ALICE, ALICE_DEV);
        let (bob_sid, plaintext) =
            bob.accept_inbound(from_alice, BOB_DEV, SHARED, prekey, &first).unwrap();
        assert_eq!(plaintext, b"hello");

        (alice, bob, alice_sid, bob_sid)
    }

    #[test]
    fn establishment_is_idempotent() {
        let mut alice = directory(1);

        let first = alice.establish(CONV, BOB, Some(BOB_DEV));
        let second = alice.establish(CONV, BOB, Some(BOB_DEV));

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(alice.pending_count(), 1);

        let prekey = KeyPair::from_seed([3u8; 32]);
        let key = SessionKey::new(CONV, BOB, BOB_DEV);
        alice.complete_establishment(key, ALICE_DEV, prekey.public_bytes(), SHARED, 1).unwrap();

        // Exactly one ratchet state exists
        assert_eq!(alice.engine().len(), 1);
        assert_eq!(alice.pending_count(), 0);

        // Established sessions are returned unchanged
        let third = alice.establish(CONV, BOB, Some(BOB_DEV));
        assert!(!third.is_new);
        assert_eq!(third.session_id, first.session_id);
    }

    #[test]
    fn reserved_session_reports_pending_until_completed() {
        let mut alice = directory(1);

        let reserved = alice.establish(CONV, BOB, Some(BOB_DEV));

        // The id exists but carries no ratchet state yet
        let err = alice.send_message(reserved.session_id, b"too early").unwrap_err();
        assert_eq!(err, EngineError::EstablishmentPending { session_id: reserved.session_id });
        assert!(err.is_transient());

        let prekey = KeyPair::from_seed([3u8; 32]);
        let key = SessionKey::new(CONV, BOB, BOB_DEV);
        alice.complete_establishment(key, ALICE_DEV, prekey.public_bytes(), SHARED, 1).unwrap();
        alice.send_message(reserved.session_id, b"now fine").unwrap();
    }

    #[test]
    fn default_device_key_is_distinct() {
        let mut alice = directory(1);

        let default = alice.establish(CONV, BOB, None);
        let explicit = alice.establish(CONV, BOB, Some(BOB_DEV));
        assert_ne!(default.session_id, explicit.session_id);
    }

    #[test]
    fn full_conversation_with_bookkeeping() {
        let (mut alice, mut bob, alice_sid, bob_sid) = established_pair();

        let reply = bob.send_message(bob_sid, b"hi").unwrap();
        let sid = alice.session_for(&SessionKey::new(CONV, BOB, BOB_DEV)).unwrap();
        assert_eq!(sid, alice_sid);
        assert_eq!(alice.receive_message(sid, &reply).unwrap(), b"hi");

        let info = alice.info(alice_sid).unwrap();
        assert_eq!(info.messages_sent, 1);
        assert_eq!(info.messages_received, 1);
        assert!(info.active);

        let info = bob.info(bob_sid).unwrap();
        assert_eq!(info.messages_received, 1);
        assert_eq!(info.messages_sent, 1);
    }

    #[test]
    fn rotation_happens_on_cadence() {
        let mut alice = directory(1);
        let mut bob = directory(2);
        alice.config.rotation_interval = 3;

        let prekey = KeyPair::from_seed([3u8; 32]);
        let to_bob = SessionKey::new(CONV, BOB, BOB_DEV);
        let alice_sid = alice
            .complete_establishment(to_bob, ALICE_DEV, prekey.public_bytes(), SHARED, 1)
            .unwrap();

        let first = alice.send_message(alice_sid, b"0").unwrap();
        let from_alice = SessionKey::new(CONV, ALICE, ALICE_DEV);
        let (bob_sid, _) =
            bob.accept_inbound(from_alice, BOB_DEV, SHARED, prekey, &first).unwrap();

        // Bob replies so rotation becomes possible
        let reply = bob.send_message(bob_sid, b"ack").unwrap();
        alice.receive_message(alice_sid, &reply).unwrap();

        let m2 = alice.send_message(alice_sid, b"1").unwrap();
        let m3 = alice.send_message(alice_sid, b"2").unwrap();
        assert_eq!(alice.info(alice_sid).unwrap().rotations, 1);

        // The rotated key only shows up on the send after the third
        let m4 = alice.send_message(alice_sid, b"3").unwrap();
        assert_ne!(
            m3.message.parts().0.ratchet_public,
            m4.message.parts().0.ratchet_public
        );

        assert_eq!(bob.receive_message(bob_sid, &m2).unwrap(), b"1");
        assert_eq!(bob.receive_message(bob_sid, &m3).unwrap(), b"2");
        assert_eq!(bob.receive_message(bob_sid, &m4).unwrap(), b"3");
    }

    #[test]
    fn future_messages_are_rejected() {
        let (mut alice, mut bob, alice_sid, bob_sid) = established_pair();

        let mut reply = bob.send_message(bob_sid, b"hi").unwrap();
        reply.sent_at_ms += 10 * 60 * 1000;

        let result = alice.receive_message(alice_sid, &reply);
        assert!(matches!(result, Err(EngineError::MessageFromFuture { .. })));
    }

    #[test]
    fn stale_messages_are_rejected() {
        let (mut alice, mut bob, alice_sid, bob_sid) = established_pair();

        let reply = bob.send_message(bob_sid, b"hi").unwrap();
        alice.env.advance(Duration::from_secs(8 * 24 * 60 * 60));

        let result = alice.receive_message(alice_sid, &reply);
        assert!(matches!(result, Err(EngineError::MessageTooOld { .. })));
    }

    #[test]
    fn close_then_cleanup_evicts() {
        let (mut alice, _bob, alice_sid, _) = established_pair();

        alice.close_session(alice_sid).unwrap();
        assert!(matches!(
            alice.send_message(alice_sid, b"x"),
            Err(EngineError::SessionNotFound { .. })
        ));

        let evicted = alice.cleanup_expired();
        assert_eq!(evicted, vec![alice_sid]);
        assert_eq!(alice.active_count(), 0);
        assert!(alice.engine().is_empty());
    }

    #[test]
    fn idle_sessions_expire() {
        let (mut alice, _bob, alice_sid, _) = established_pair();

        alice.env.advance(Duration::from_secs(31 * 24 * 60 * 60));
        let evicted = alice.cleanup_expired();
        assert_eq!(evicted, vec![alice_sid]);
    }

    #[test]
    fn active_sessions_survive_cleanup() {
        let (mut alice, _bob, _, _) = established_pair();

        assert!(alice.cleanup_expired().is_empty());
        assert_eq!(alice.active_count(), 1);
    }

    #[test]
    fn rotate_for_user_touches_every_session() {
        let (mut alice, mut bob, alice_sid, bob_sid) = established_pair();

        // Both directions established so rotation applies
        let reply = bob.send_message(bob_sid, b"ack").unwrap();
        alice.receive_message(alice_sid, &reply).unwrap();

        let rotated = alice.rotate_for_user(BOB).unwrap();
        assert_eq!(rotated, 1);
        assert_eq!(alice.info(alice_sid).unwrap().rotations, 1);

        // Conversation continues after the forced rotation
        let m = alice.send_message(alice_sid, b"post-rotate").unwrap();
        assert_eq!(bob.receive_message(bob_sid, &m).unwrap(), b"post-rotate");
    }

    #[test]
    fn rotate_for_user_skips_unanswered_sessions() {
        let mut alice = directory(1);
        let prekey = KeyPair::from_seed([3u8; 32]);

        // Sender-side only: the peer never replied, so the only chain it
        // can derive is the prekey chain and rotation has nothing to do
        let to_bob = SessionKey::new(CONV, BOB, BOB_DEV);
        let alice_sid = alice
            .complete_establishment(to_bob, ALICE_DEV, prekey.public_bytes(), SHARED, 1)
            .unwrap();

        let rotated = alice.rotate_for_user(BOB).unwrap();
        assert_eq!(rotated, 0);
        assert_eq!(alice.info(alice_sid).unwrap().rotations, 0);
    }

    #[test]
    fn verification_status_tracks_per_device() {
        let (mut alice, _bob, alice_sid, _) = established_pair();

        assert_eq!(
            alice.info(alice_sid).unwrap().verification,
            VerificationStatus::Unverified
        );

        let updated =
            alice.set_verification_for_device(BOB, BOB_DEV, VerificationStatus::Verified);
        assert_eq!(updated, 1);
        assert_eq!(
            alice.info(alice_sid).unwrap().verification,
            VerificationStatus::Verified
        );

        let established = alice.establish(CONV, BOB, Some(BOB_DEV));
        assert!(!established.requires_verification);
    }

    #[test]
    fn persist_and_load_resume_sessions() {
        let (mut alice, bob, alice_sid, bob_sid) = established_pair();
        let store = MemoryStore::new();

        bob.persist(&store).unwrap();

        let mut restored =
            SessionDirectory::load(MockEnv::seeded(7), DirectoryConfig::default(), &store)
                .unwrap()
                .unwrap();
        assert_eq!(restored.active_count(), 1);

        let m = alice.send_message(alice_sid, b"after restart").unwrap();
        assert_eq!(restored.receive_message(bob_sid, &m).unwrap(), b"after restart");
    }

    #[test]
    fn load_from_empty_store_is_none() {
        let store = MemoryStore::new();
        let loaded =
            SessionDirectory::<MockEnv>::load(MockEnv::new(), DirectoryConfig::default(), &store)
                .unwrap();
        assert!(loaded.is_none());
    }
}
