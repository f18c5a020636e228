//! Per-session ratchet state.
//!
//! # Invariants
//!
//! - `ns`/`nr` (the chain indices) are monotonically non-decreasing within
//!   a chain; a DH ratchet turn resets both to 0 and snapshots the old
//!   `ns` into `pn`
//! - The skipped-key buffer never grows past [`MAX_SKIP`] entries ahead of
//!   `nr`; exceeding the window is a hard failure, never a silent drop
//! - A receiving chain exists iff a remote public key is known

use std::collections::HashMap;

use fanlock_crypto::{ChainKey, KeyPair, MessageKey, RootKey, kdf_root};
use serde::{Deserialize, Serialize};

use crate::{
    error::EngineError,
    message::{ConversationId, DeviceId, SessionId},
};

/// Maximum number of message keys derived ahead of the receive counter to
/// tolerate out-of-order delivery.
pub const MAX_SKIP: u32 = 1000;

/// One session's ratchet state.
pub(crate) struct RatchetState {
    pub(crate) session_id: SessionId,
    pub(crate) conversation_id: ConversationId,
    pub(crate) local_device: DeviceId,
    pub(crate) remote_device: DeviceId,

    pub(crate) root_key: RootKey,
    pub(crate) sending_chain: Option<ChainKey>,
    pub(crate) receiving_chain: Option<ChainKey>,
    pub(crate) local_pair: KeyPair,
    pub(crate) remote_public: Option<[u8; 32]>,

    /// Length of the previous sending chain, snapshotted at each turn
    pub(crate) pn: u32,

    /// Message keys derived ahead of `nr`, keyed by (remote public key,
    /// chain index)
    pub(crate) skipped: HashMap<([u8; 32], u32), MessageKey>,

    /// Prekey id to advertise in outbound headers until the first inbound
    /// message confirms the peer holds the session
    pub(crate) pending_prekey: Option<u32>,

    /// Set by a DH turn; the next encrypt must re-derive the sending
    /// chain with a fresh key pair before sealing anything.
    ///
    /// The fresh pair is generated at send time, not at turn time, so
    /// `local_pair` always equals the key the peer last saw. The peer's
    /// receive derivation depends on that.
    pub(crate) send_chain_stale: bool,

    /// Set by a proactive rotation; cleared by the next DH turn. Prevents
    /// stacking a second key change the peer could never absorb.
    pub(crate) rotated_since_turn: bool,

    pub(crate) created_at_ms: u64,
    pub(crate) updated_at_ms: u64,
}

impl RatchetState {
    /// Messages sent in the current sending chain.
    pub(crate) fn ns(&self) -> u32 {
        self.sending_chain.as_ref().map_or(0, ChainKey::index)
    }

    /// Messages received in the current receiving chain.
    pub(crate) fn nr(&self) -> u32 {
        self.receiving_chain.as_ref().map_or(0, ChainKey::index)
    }

    /// Consume a buffered skipped key for (remote key, index), if present.
    pub(crate) fn take_skipped(&mut self, remote: &[u8; 32], index: u32) -> Option<MessageKey> {
        self.skipped.remove(&(*remote, index))
    }

    /// Advance the receiving chain to `target`, buffering every
    /// intervening message key under the current remote public key.
    ///
    /// No-op when no receiving chain exists yet or the chain is already at
    /// or past `target`.
    pub(crate) fn catch_up_receiving(&mut self, target: u32) -> Result<(), EngineError> {
        let Some(remote) = self.remote_public else {
            return Ok(());
        };
        let Some(chain) = self.receiving_chain.as_mut() else {
            return Ok(());
        };

        if target > chain.index().saturating_add(MAX_SKIP) {
            return Err(EngineError::TooManySkippedMessages {
                current: chain.index(),
                requested: target,
                max: MAX_SKIP,
            });
        }

        while chain.index() < target {
            if self.skipped.len() >= MAX_SKIP as usize {
                return Err(EngineError::TooManySkippedMessages {
                    current: chain.index(),
                    requested: target,
                    max: MAX_SKIP,
                });
            }

            let key = chain
                .advance()
                .map_err(|e| EngineError::KeyGenerationFailed { reason: e.to_string() })?;
            self.skipped.insert((remote, key.index()), key);
        }

        Ok(())
    }

    /// DH ratchet turn on receipt of a new remote public key.
    ///
    /// Performs the receive-side root step: the new receiving chain is
    /// derived from the current (advertised) local pair against the new
    /// remote key. The send side is only marked stale; the fresh key pair
    /// and the send-side root step happen on the next
    /// [`refresh_sending`](Self::refresh_sending), so the key the peer
    /// derives against never changes before it is advertised.
    pub(crate) fn turn(&mut self, new_remote: [u8; 32]) -> Result<(), EngineError> {
        let dh = checked_agree(&self.local_pair, &new_remote)?;
        let (root, receiving) = kdf_root(&self.root_key, &dh);
        self.root_key = root;
        self.receiving_chain = Some(receiving);

        self.remote_public = Some(new_remote);
        self.send_chain_stale = true;
        self.rotated_since_turn = false;

        Ok(())
    }

    /// Send-side root step: generate a fresh key pair and derive a new
    /// sending chain against the last known remote key.
    ///
    /// Snapshots the old sending chain length into `pn` so receivers can
    /// close out the superseded chain.
    pub(crate) fn refresh_sending(&mut self, fresh_seed: [u8; 32]) -> Result<(), EngineError> {
        let Some(remote) = self.remote_public else {
            return Err(EngineError::KeyGenerationFailed {
                reason: "no remote ratchet key to derive a sending chain against".to_string(),
            });
        };

        self.pn = self.ns();
        self.local_pair = KeyPair::from_seed(fresh_seed);

        let dh = checked_agree(&self.local_pair, &remote)?;
        let (root, sending) = kdf_root(&self.root_key, &dh);
        self.root_key = root;
        self.sending_chain = Some(sending);
        self.send_chain_stale = false;

        Ok(())
    }

    /// Serializable snapshot of this state.
    pub(crate) fn snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot {
            session_id: self.session_id,
            conversation_id: self.conversation_id,
            local_device: self.local_device,
            remote_device: self.remote_device,
            root_key: *self.root_key.as_bytes(),
            sending_chain: self.sending_chain.as_ref().map(|c| (*c.as_bytes(), c.index())),
            receiving_chain: self.receiving_chain.as_ref().map(|c| (*c.as_bytes(), c.index())),
            local_secret: self.local_pair.secret_bytes(),
            remote_public: self.remote_public,
            pn: self.pn,
            skipped: self
                .skipped
                .iter()
                .map(|(&(remote_public, index), key)| SkippedEntry {
                    remote_public,
                    index,
                    key: *key.key(),
                })
                .collect(),
            pending_prekey: self.pending_prekey,
            send_chain_stale: self.send_chain_stale,
            rotated_since_turn: self.rotated_since_turn,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        }
    }

    /// Rebuild state from a snapshot.
    pub(crate) fn from_snapshot(snapshot: RatchetSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            conversation_id: snapshot.conversation_id,
            local_device: snapshot.local_device,
            remote_device: snapshot.remote_device,
            root_key: RootKey::from_bytes(snapshot.root_key),
            sending_chain: snapshot
                .sending_chain
                .map(|(key, index)| ChainKey::from_parts(key, index)),
            receiving_chain: snapshot
                .receiving_chain
                .map(|(key, index)| ChainKey::from_parts(key, index)),
            local_pair: KeyPair::from_seed(snapshot.local_secret),
            remote_public: snapshot.remote_public,
            pn: snapshot.pn,
            skipped: snapshot
                .skipped
                .into_iter()
                .map(|entry| {
                    ((entry.remote_public, entry.index), MessageKey::from_parts(entry.key, entry.index))
                })
                .collect(),
            pending_prekey: snapshot.pending_prekey,
            send_chain_stale: snapshot.send_chain_stale,
            rotated_since_turn: snapshot.rotated_since_turn,
            created_at_ms: snapshot.created_at_ms,
            updated_at_ms: snapshot.updated_at_ms,
        }
    }
}

/// Key agreement that rejects the degenerate all-zero output produced by
/// low-order peer points.
pub(crate) fn checked_agree(pair: &KeyPair, peer: &[u8; 32]) -> Result<[u8; 32], EngineError> {
    let shared = pair.agree(peer);
    if shared == [0u8; 32] {
        return Err(EngineError::KeyGenerationFailed {
            reason: "degenerate key agreement output".to_string(),
        });
    }
    Ok(shared)
}

/// One buffered skipped key in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    /// Remote public key the chain belonged to
    pub remote_public: [u8; 32],
    /// Chain index of the buffered key
    pub index: u32,
    /// Raw message key bytes
    pub key: [u8; 32],
}

/// Versioned, serializable snapshot of one session's ratchet state.
///
/// Encoded with the crate-wide CBOR format version
/// (see [`encode_versioned`](crate::message::encode_versioned)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetSnapshot {
    /// Session id the state belongs to
    pub session_id: SessionId,
    /// Conversation id
    pub conversation_id: ConversationId,
    /// Local device id
    pub local_device: DeviceId,
    /// Remote device id
    pub remote_device: DeviceId,
    /// Root key bytes
    pub root_key: [u8; 32],
    /// Sending chain (key, index), if established
    pub sending_chain: Option<([u8; 32], u32)>,
    /// Receiving chain (key, index), if established
    pub receiving_chain: Option<([u8; 32], u32)>,
    /// Local ratchet secret
    pub local_secret: [u8; 32],
    /// Last known remote ratchet public key
    pub remote_public: Option<[u8; 32]>,
    /// Previous sending chain length
    pub pn: u32,
    /// Buffered skipped keys
    pub skipped: Vec<SkippedEntry>,
    /// Prekey id still advertised in outbound headers, if any
    pub pending_prekey: Option<u32>,
    /// Whether the sending chain must be re-derived before the next send
    pub send_chain_stale: bool,
    /// Whether a proactive rotation is outstanding
    pub rotated_since_turn: bool,
    /// Creation timestamp (Unix ms)
    pub created_at_ms: u64,
    /// Last update timestamp (Unix ms)
    pub updated_at_ms: u64,
}
