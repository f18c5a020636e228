//! Messaging context: the explicit lifecycle object tying the engine
//! together.
//!
//! A context is one (user, device) identity plus its session directory and
//! device registry. No global state: contexts are constructed, discarded,
//! and reconstructed freely, which is what makes the whole engine testable.

use std::collections::HashMap;

use bytes::Bytes;
use fanlock_crypto::{KeyPair, SigningIdentity};

use crate::{
    devices::{DeviceRegistry, DeviceStatus, RegisteredDevice, RegistryConfig},
    directory::{DirectoryConfig, SessionDirectory, VerificationStatus},
    env::Environment,
    error::EngineError,
    message::{
        ConversationId, DeviceId, Envelope, FanoutMessage, KeySyncEntry, KeySyncNotice,
        SessionKey, UserId, encode_versioned,
    },
    transport::Transport,
};

/// Result of a fan-out encryption.
///
/// Partial success is expected: devices that failed encryption are listed
/// in `failed` and absent from the message's per-device map.
pub struct Fanout {
    /// The logical message with one ciphertext per reachable device
    pub message: FanoutMessage,
    /// Devices that could not be encrypted for, with the reason
    pub failed: Vec<(DeviceId, EngineError)>,
}

/// One device's view of the messaging engine.
pub struct MessagingContext<E: Environment> {
    env: E,
    user_id: UserId,
    device_id: DeviceId,
    signing: SigningIdentity,
    prekey: KeyPair,
    directory: SessionDirectory<E>,
    registry: DeviceRegistry<E>,
}

impl<E: Environment> MessagingContext<E> {
    /// Create a context, registering the current device.
    pub fn new(env: E, user_id: UserId, device_name: &str) -> Result<Self, EngineError> {
        let directory = SessionDirectory::new(env.clone(), DirectoryConfig::default());
        let mut registry = DeviceRegistry::new(env.clone(), RegistryConfig::default());

        let registered = registry.register_device(user_id, device_name, true)?;
        tracing::info!(user_id, device_id = registered.device_id, "messaging context created");

        Ok(Self {
            env,
            user_id,
            device_id: registered.device_id,
            signing: registered.signing,
            prekey: registered.prekey,
            directory,
            registry,
        })
    }

    /// The user this context belongs to.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The device this context runs as.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// This device's signing identity.
    pub fn signing(&self) -> &SigningIdentity {
        &self.signing
    }

    /// This device's published prekey pair.
    pub fn prekey(&self) -> &KeyPair {
        &self.prekey
    }

    /// The environment this context runs in.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Session directory access.
    pub fn directory(&self) -> &SessionDirectory<E> {
        &self.directory
    }

    /// Mutable session directory access.
    pub fn directory_mut(&mut self) -> &mut SessionDirectory<E> {
        &mut self.directory
    }

    /// Device registry access.
    pub fn registry(&self) -> &DeviceRegistry<E> {
        &self.registry
    }

    /// Mutable device registry access.
    pub fn registry_mut(&mut self) -> &mut DeviceRegistry<E> {
        &mut self.registry
    }

    /// Register a companion device for this user.
    ///
    /// The device starts untrusted; it must answer its challenge through
    /// [`verify_device`](Self::verify_device) before it becomes a sync
    /// target.
    pub fn register_companion(&mut self, name: &str) -> Result<RegisteredDevice, EngineError> {
        self.registry.register_device(self.user_id, name, false)
    }

    /// Record a peer's device under the id and public keys the peer
    /// published.
    ///
    /// Fan-out maps are keyed by device id, so both sides must share one
    /// id space: the owner allocates the id, everyone else imports it.
    /// Returns the trust challenge nonce for the owning device to sign,
    /// or `None` when the device was already known.
    pub fn import_peer_device(
        &mut self,
        user_id: UserId,
        device_id: DeviceId,
        name: &str,
        signing_public: [u8; 32],
        prekey_public: [u8; 32],
    ) -> Result<Option<[u8; 32]>, EngineError> {
        self.registry.import_device(user_id, device_id, name, signing_public, prekey_public)
    }

    /// Answer a device's trust challenge and, on success, mark every
    /// session with that device verified.
    pub fn verify_device(
        &mut self,
        device_id: DeviceId,
        response: &[u8],
    ) -> Result<bool, EngineError> {
        let good = self.registry.verify_device(device_id, response)?;
        if good {
            let Some(record) = self.registry.device(device_id) else {
                return Ok(good);
            };
            let user_id = record.user_id;
            self.directory.set_verification_for_device(
                user_id,
                device_id,
                VerificationStatus::Verified,
            );
        }
        Ok(good)
    }

    /// Answer a device's trust challenge and, on success, push an
    /// immediate key-sync notice to the newly trusted device so it can
    /// provision the sessions this context already holds.
    pub async fn verify_device_with_sync<T: Transport + ?Sized>(
        &mut self,
        device_id: DeviceId,
        response: &[u8],
        transport: &T,
    ) -> Result<bool, EngineError> {
        let good = self.verify_device(device_id, response)?;
        if good {
            self.sync_device(device_id, transport).await?;
        }
        Ok(good)
    }

    /// Revoke a device and rotate every session shared with its owner, so
    /// keys the revoked device may have cached stop decrypting new
    /// traffic. Returns how many sessions actually rotated; sessions the
    /// peer has never replied on have no rotatable chain yet and are
    /// skipped.
    pub fn revoke_device(&mut self, device_id: DeviceId) -> Result<usize, EngineError> {
        let user_id = self.registry.revoke_device(device_id)?;
        self.directory.rotate_for_user(user_id)
    }

    /// Encrypt one logical message independently for every target device.
    ///
    /// Targets are the explicit list, or every verified device of the
    /// recipient when omitted. Explicit targets must be verified: an
    /// unknown or untrusted device fails its slot without a ciphertext.
    /// A device that fails is logged and omitted; the call succeeds with
    /// the remaining devices.
    pub fn encrypt_for_devices(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        plaintext: &[u8],
        targets: Option<&[DeviceId]>,
    ) -> Fanout {
        let targets: Vec<DeviceId> = match targets {
            Some(explicit) => explicit.to_vec(),
            None => self.registry.verified_devices(user_id),
        };

        let mut per_device: HashMap<DeviceId, Envelope> = HashMap::new();
        let mut failed = Vec::new();

        for device_id in targets {
            let result = match self.registry.device(device_id) {
                None => Err(EngineError::DeviceNotFound { device_id }),
                Some(record) if record.status != DeviceStatus::Verified => {
                    Err(EngineError::DeviceNotTrusted { device_id })
                }
                Some(_) => {
                    let key = SessionKey::new(conversation_id, user_id, device_id);
                    match self.directory.session_for(&key) {
                        Some(session_id) => self.directory.send_message(session_id, plaintext),
                        None => Err(EngineError::NoSessionWithDevice { device_id }),
                    }
                }
            };
            match result {
                Ok(envelope) => {
                    per_device.insert(device_id, envelope);
                }
                Err(e) => {
                    tracing::warn!(device_id, error = %e, "fan-out skipped device");
                    failed.push((device_id, e));
                }
            }
        }

        Fanout {
            message: FanoutMessage {
                message_id: self.env.random_u128(),
                conversation_id,
                sender_user: self.user_id,
                sender_device: self.device_id,
                sent_at_ms: self.env.now_ms(),
                per_device,
            },
            failed,
        }
    }

    /// Decrypt this device's entry of a fan-out message.
    pub fn decrypt_from_device(
        &mut self,
        fanout: &FanoutMessage,
    ) -> Result<Vec<u8>, EngineError> {
        let envelope = fanout
            .per_device
            .get(&self.device_id)
            .ok_or(EngineError::NotEncryptedForDevice { device_id: self.device_id })?;

        let key =
            SessionKey::new(fanout.conversation_id, fanout.sender_user, fanout.sender_device);
        let session_id = self
            .directory
            .session_for(&key)
            .ok_or(EngineError::NoSessionWithDevice { device_id: fanout.sender_device })?;

        self.directory.receive_message(session_id, envelope)
    }

    fn key_sync_notice(&self, device_id: DeviceId) -> KeySyncNotice {
        let sessions = self
            .directory
            .active_sessions()
            .into_iter()
            .map(|key| KeySyncEntry {
                conversation_id: key.conversation_id,
                peer_user: key.user_id,
                peer_device: key.device_id,
                peer_prekey_public: self
                    .registry
                    .device(key.device_id)
                    .map(|record| record.prekey_public),
            })
            .collect();

        KeySyncNotice {
            user_id: self.user_id,
            device_id,
            sessions,
            issued_at_ms: self.env.now_ms(),
        }
    }

    /// Deliver a key-sync notice to one device immediately.
    pub async fn sync_device<T: Transport + ?Sized>(
        &mut self,
        device_id: DeviceId,
        transport: &T,
    ) -> Result<(), EngineError> {
        let notice = self.key_sync_notice(device_id);
        let payload = Bytes::from(encode_versioned(&notice)?);
        transport.deliver(device_id, payload).await?;
        tracing::debug!(device_id, sessions = notice.sessions.len(), "key sync delivered");
        Ok(())
    }

    /// Deliver a key-sync notice to every trusted companion device.
    ///
    /// Per-device failures are logged and the sweep continues. Returns
    /// how many notices were delivered.
    pub async fn key_sync_sweep<T: Transport + ?Sized>(&mut self, transport: &T) -> usize {
        let targets = self.registry.trusted_sync_targets(self.user_id);

        let mut delivered = 0;
        for device_id in targets {
            match self.sync_device(device_id, transport).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(device_id, error = %e, "key sync delivery failed");
                }
            }
        }

        tracing::debug!(delivered, "key sync sweep finished");
        delivered
    }

    /// Apply a key-sync notice received from another of this user's
    /// devices.
    ///
    /// Reserves an establishment for every announced session this device
    /// does not hold yet, so the handshake that follows completes under a
    /// stable id. Returns how many establishments were newly reserved.
    pub fn handle_key_sync(&mut self, notice: &KeySyncNotice) -> usize {
        if notice.user_id != self.user_id {
            tracing::warn!(notice_user = notice.user_id, "dropping key sync for another user");
            return 0;
        }

        let mut reserved = 0;
        for entry in &notice.sessions {
            let established =
                self.directory.establish(entry.conversation_id, entry.peer_user, Some(entry.peer_device));
            if established.is_new {
                reserved += 1;
            }
        }
        tracing::debug!(reserved, "applied key sync notice");
        reserved
    }

    /// Refresh the current device's last-seen timestamp.
    pub fn heartbeat_tick(&mut self) -> Result<(), EngineError> {
        self.registry.touch(self.device_id)
    }

    /// Drop expired challenges and evict expired sessions.
    ///
    /// Returns `(challenges_expired, sessions_evicted)`.
    pub fn cleanup_tick(&mut self) -> (usize, usize) {
        let challenges = self.registry.expire_challenges();
        let sessions = self.directory.cleanup_expired().len();
        (challenges, sessions)
    }

    /// Tear the context down, discarding all key material.
    pub fn shutdown(self) {
        tracing::info!(user_id = self.user_id, device_id = self.device_id, "context shut down");
    }
}
