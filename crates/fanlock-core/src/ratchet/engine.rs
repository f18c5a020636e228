//! The Double Ratchet engine: session key evolution and message sealing.

use std::collections::HashMap;

use fanlock_crypto::{KeyPair, RootKey, build_nonce, kdf_root, open, seal};

use crate::{
    env::Environment,
    error::EngineError,
    message::{
        ConversationId, DeviceId, EncryptedBody, Envelope, MessageHeader, RatchetMessage,
        SessionId,
    },
};

use super::state::{RatchetSnapshot, RatchetState, checked_agree};

/// Observable ratchet counters for one session.
///
/// Exposed for diagnostics and tests; never used for protocol decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetCounters {
    /// Messages sent in the current sending chain
    pub ns: u32,
    /// Messages received in the current receiving chain
    pub nr: u32,
    /// Length of the previous sending chain
    pub pn: u32,
    /// Buffered skipped keys
    pub skipped: usize,
}

/// Owns every ratchet session on this device and evolves their key
/// material.
///
/// The engine is purely synchronous. Session ids are allocated by the
/// session directory; the engine treats them as opaque handles.
pub struct RatchetEngine<E: Environment> {
    env: E,
    sessions: HashMap<SessionId, RatchetState>,
}

impl<E: Environment> RatchetEngine<E> {
    /// Create an engine with no sessions.
    pub fn new(env: E) -> Self {
        Self { env, sessions: HashMap::new() }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// True when a session exists under this id.
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Initialize the sending side of a new session.
    ///
    /// The caller has run the establishment handshake against one of the
    /// peer's published prekeys and holds the resulting shared secret. A
    /// fresh ratchet key pair is generated and the first sending chain is
    /// derived immediately; the receiving chain stays empty until the
    /// peer's first reply turns the DH ratchet.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize_as_sender(
        &mut self,
        session_id: SessionId,
        conversation_id: ConversationId,
        local_device: DeviceId,
        remote_device: DeviceId,
        remote_public: [u8; 32],
        shared_secret: [u8; 32],
        prekey_id: u32,
    ) -> Result<(), EngineError> {
        let local_pair = KeyPair::from_seed(self.env.random_seed());
        let dh = checked_agree(&local_pair, &remote_public)?;

        let root = RootKey::from_bytes(shared_secret);
        let (root, sending) = kdf_root(&root, &dh);

        let now_ms = self.env.now_ms();
        self.sessions.insert(
            session_id,
            RatchetState {
                session_id,
                conversation_id,
                local_device,
                remote_device,
                root_key: root,
                sending_chain: Some(sending),
                receiving_chain: None,
                local_pair,
                remote_public: Some(remote_public),
                pn: 0,
                skipped: HashMap::new(),
                pending_prekey: Some(prekey_id),
                send_chain_stale: false,
                rotated_since_turn: false,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        );

        tracing::debug!(session_id, conversation_id, remote_device, "initialized sending session");
        Ok(())
    }

    /// Initialize the receiving side of a session from its first inbound
    /// envelope and return the decrypted plaintext.
    ///
    /// `local_prekey` is the key pair whose public half the sender
    /// encapsulated to. The first decrypt turns the DH ratchet against the
    /// sender's ratchet key, deriving both chains. If decryption fails the
    /// session is not created.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize_as_receiver(
        &mut self,
        session_id: SessionId,
        conversation_id: ConversationId,
        local_device: DeviceId,
        remote_device: DeviceId,
        shared_secret: [u8; 32],
        local_prekey: KeyPair,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, EngineError> {
        let now_ms = self.env.now_ms();
        self.sessions.insert(
            session_id,
            RatchetState {
                session_id,
                conversation_id,
                local_device,
                remote_device,
                root_key: RootKey::from_bytes(shared_secret),
                sending_chain: None,
                receiving_chain: None,
                local_pair: local_prekey,
                remote_public: None,
                pn: 0,
                skipped: HashMap::new(),
                pending_prekey: None,
                send_chain_stale: false,
                rotated_since_turn: false,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        );

        match self.decrypt(session_id, envelope) {
            Ok(plaintext) => {
                tracing::debug!(
                    session_id,
                    conversation_id,
                    remote_device,
                    "initialized receiving session"
                );
                Ok(plaintext)
            }
            Err(e) => {
                self.sessions.remove(&session_id);
                Err(e)
            }
        }
    }

    /// Encrypt a message, advancing the sending chain by one step.
    ///
    /// The first send after a DH turn (or a rotation) performs the
    /// deferred send-side root step: fresh key pair, new sending chain.
    pub fn encrypt(
        &mut self,
        session_id: SessionId,
        plaintext: &[u8],
    ) -> Result<Envelope, EngineError> {
        let mut suffix = [0u8; 8];
        self.env.random_bytes(&mut suffix);
        let fresh_seed = self.env.random_seed();
        let now_ms = self.env.now_ms();

        let state = self
            .sessions
            .get_mut(&session_id)
            .ok_or(EngineError::SessionNotFound { session_id })?;

        if state.send_chain_stale {
            state.refresh_sending(fresh_seed)?;
        }

        let Some(chain) = state.sending_chain.as_mut() else {
            return Err(EngineError::KeyGenerationFailed {
                reason: "sending chain not established".to_string(),
            });
        };

        let key = chain
            .advance()
            .map_err(|e| EngineError::KeyGenerationFailed { reason: e.to_string() })?;

        let header = MessageHeader {
            ratchet_public: state.local_pair.public_bytes(),
            previous_chain_len: state.pn,
            index: key.index(),
        };

        let nonce = build_nonce(session_id, header.index, header.previous_chain_len, suffix);
        let body = EncryptedBody { nonce, ciphertext: seal(&key, &nonce, plaintext) };

        let message = match state.pending_prekey {
            Some(prekey_id) => RatchetMessage::Prekey { header, prekey_id, body },
            None => RatchetMessage::Chained { header, body },
        };

        state.updated_at_ms = now_ms;
        Ok(Envelope { session_id, sent_at_ms: now_ms, message })
    }

    /// Decrypt an inbound envelope, evolving the ratchet as needed.
    ///
    /// Pipeline, in order:
    /// 1. Skipped-key hit: messages from a superseded chain stay
    ///    decryptable after a DH turn
    /// 2. New remote key: close out the old receiving chain up to the
    ///    header's `previous_chain_len`, then turn the DH ratchet
    /// 3. Catch the receiving chain up to the header index, buffering
    ///    intervening keys
    /// 4. Advance once and open
    ///
    /// On any failure past the skipped-key lookup the session state is
    /// rolled back, so a forged or corrupted message cannot desynchronize
    /// the ratchet.
    pub fn decrypt(
        &mut self,
        session_id: SessionId,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, EngineError> {
        let now_ms = self.env.now_ms();

        let state = self
            .sessions
            .get_mut(&session_id)
            .ok_or(EngineError::SessionNotFound { session_id })?;

        let (header, body) = envelope.message.parts();

        if let Some(key) = state.take_skipped(&header.ratchet_public, header.index) {
            return match open(&key, &body.nonce, &body.ciphertext) {
                Ok(plaintext) => {
                    state.updated_at_ms = now_ms;
                    Ok(plaintext)
                }
                Err(_) => {
                    // The buffered key is still the right one for the
                    // genuine message at this index
                    state.skipped.insert((header.ratchet_public, header.index), key);
                    Err(EngineError::DecryptionFailed { message_index: header.index })
                }
            };
        }

        let rollback = state.snapshot();
        match Self::decrypt_in_place(state, header, body) {
            Ok(plaintext) => {
                state.pending_prekey = None;
                state.updated_at_ms = now_ms;
                Ok(plaintext)
            }
            Err(e) => {
                *state = RatchetState::from_snapshot(rollback);
                Err(e)
            }
        }
    }

    fn decrypt_in_place(
        state: &mut RatchetState,
        header: &MessageHeader,
        body: &EncryptedBody,
    ) -> Result<Vec<u8>, EngineError> {
        if state.remote_public != Some(header.ratchet_public) {
            state.catch_up_receiving(header.previous_chain_len)?;
            state.turn(header.ratchet_public)?;
        }

        state.catch_up_receiving(header.index)?;

        let Some(chain) = state.receiving_chain.as_mut() else {
            return Err(EngineError::KeyGenerationFailed {
                reason: "receiving chain not established".to_string(),
            });
        };

        if chain.index() > header.index {
            // Key already consumed: replayed or duplicated message
            return Err(EngineError::DecryptionFailed { message_index: header.index });
        }

        let key = chain
            .advance()
            .map_err(|e| EngineError::KeyGenerationFailed { reason: e.to_string() })?;

        open(&key, &body.nonce, &body.ciphertext)
            .map_err(|_| EngineError::DecryptionFailed { message_index: header.index })
    }

    /// Proactively rotate the sending side of a session.
    ///
    /// Performs an extra send-side root step: a fresh local key pair and
    /// a new sending chain against the last known remote key. The peer
    /// re-derives the same chain from the new public key in the next
    /// header via its normal turn path. At most one rotation is applied
    /// per DH turn; further calls are no-ops until the peer's next key
    /// change, since the peer can only absorb one extra key change per
    /// turn. Rotation is also a no-op while a deferred send-side step is
    /// already pending, and before the peer has replied at all - until
    /// then the peer can only derive the prekey chain from the original
    /// key. Returns whether the rotation was applied, so callers only
    /// count rotations that actually happened.
    pub fn rotate(&mut self, session_id: SessionId) -> Result<bool, EngineError> {
        let fresh_seed = self.env.random_seed();
        let now_ms = self.env.now_ms();

        let state = self
            .sessions
            .get_mut(&session_id)
            .ok_or(EngineError::SessionNotFound { session_id })?;

        if state.receiving_chain.is_none() || state.send_chain_stale || state.rotated_since_turn {
            return Ok(false);
        }

        state.refresh_sending(fresh_seed)?;
        state.rotated_since_turn = true;
        state.updated_at_ms = now_ms;

        tracing::debug!(session_id, "rotated sending ratchet");
        Ok(true)
    }

    /// Remove a session, discarding all of its key material.
    ///
    /// Returns true when a session existed under this id.
    pub fn remove_session(&mut self, session_id: SessionId) -> bool {
        self.sessions.remove(&session_id).is_some()
    }

    /// Snapshot one session for persistence.
    pub fn snapshot(&self, session_id: SessionId) -> Result<RatchetSnapshot, EngineError> {
        self.sessions
            .get(&session_id)
            .map(RatchetState::snapshot)
            .ok_or(EngineError::SessionNotFound { session_id })
    }

    /// Snapshot every session for persistence.
    pub fn snapshot_all(&self) -> Vec<RatchetSnapshot> {
        self.sessions.values().map(RatchetState::snapshot).collect()
    }

    /// Restore a session from a snapshot, replacing any session already
    /// held under the same id.
    pub fn restore(&mut self, snapshot: RatchetSnapshot) {
        let state = RatchetState::from_snapshot(snapshot);
        self.sessions.insert(state.session_id, state);
    }

    /// Ratchet counters for a session, if it exists.
    pub fn counters(&self, session_id: SessionId) -> Option<RatchetCounters> {
        self.sessions.get(&session_id).map(|state| RatchetCounters {
            ns: state.ns(),
            nr: state.nr(),
            pn: state.pn,
            skipped: state.skipped.len(),
        })
    }

    /// Conversation a session belongs to, if it exists.
    pub fn conversation_of(&self, session_id: SessionId) -> Option<ConversationId> {
        self.sessions.get(&session_id).map(|state| state.conversation_id)
    }

    /// Last activity timestamp for a session, if it exists.
    pub fn last_activity_ms(&self, session_id: SessionId) -> Option<u64> {
        self.sessions.get(&session_id).map(|state| state.updated_at_ms)
    }
}
