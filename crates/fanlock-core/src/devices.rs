//! Device registry: identities, trust challenges, revocation.
//!
//! Each device carries an Ed25519 signing identity and an X25519 prekey.
//! New non-current devices start untrusted and must answer a signed-nonce
//! challenge before they participate in key synchronization.
//!
//! Verification state machine: `Pending -> Verified` on a good response,
//! `Pending -> Rejected` on a bad one, `Pending -> Expired` when the
//! challenge times out. `Verified` is terminal except for revocation,
//! which deletes the record outright.

use std::{collections::HashMap, time::Duration};

use fanlock_crypto::{KeyPair, SigningIdentity, challenge_digest, verify_detached};

use crate::{
    env::Environment,
    error::EngineError,
    message::{DeviceId, UserId},
};

/// Maximum devices per user.
pub const MAX_DEVICES: usize = 10;

/// Trust level of the current device.
const TRUST_CURRENT: u8 = 10;

/// Trust level granted by a passed challenge.
const TRUST_VERIFIED: u8 = 7;

/// Trust level of an unverified device.
const TRUST_PENDING: u8 = 0;

/// Tuning knobs for device trust.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Device cap per user
    pub max_devices: usize,
    /// How long a trust challenge stays answerable
    pub challenge_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_devices: MAX_DEVICES, challenge_ttl: Duration::from_secs(10 * 60) }
    }
}

/// Verification state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Registered, challenge outstanding
    Pending,
    /// Challenge passed (or the current device)
    Verified,
    /// Challenge failed
    Rejected,
    /// Challenge timed out
    Expired,
}

/// How a pending device proves itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Ed25519 signature over the challenge nonce
    SignedNonce,
    /// Short numeric code compared out of band
    NumericCode,
}

/// One device's registry record. Holds public material only.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Device id
    pub device_id: DeviceId,
    /// Owning user
    pub user_id: UserId,
    /// Human-readable name
    pub name: String,
    /// Ed25519 verification key
    pub signing_public: [u8; 32],
    /// X25519 prekey the device publishes for session establishment
    pub prekey_public: [u8; 32],
    /// Trust level, 0 to 10
    pub trust_level: u8,
    /// Verification state
    pub status: DeviceStatus,
    /// Registration time (Unix ms)
    pub registered_at_ms: u64,
    /// Last heartbeat or activity (Unix ms)
    pub last_seen_ms: u64,
    /// True for the device this context runs as
    pub is_current: bool,
}

/// One outstanding trust challenge.
#[derive(Debug, Clone)]
pub struct TrustChallenge {
    /// Nonce the device must sign
    pub nonce: [u8; 32],
    /// Digest binding the nonce to the device's signing key
    pub expected_digest: [u8; 32],
    /// When the challenge stops being answerable (Unix ms)
    pub expires_at_ms: u64,
    /// Challenge mechanism
    pub kind: ChallengeKind,
}

/// Registration result. The secret halves of both identities are handed
/// to the caller exactly once and never stored in the registry.
#[derive(Debug)]
pub struct RegisteredDevice {
    /// Allocated device id
    pub device_id: DeviceId,
    /// Ed25519 identity (secret half included)
    pub signing: SigningIdentity,
    /// X25519 prekey pair (secret half included)
    pub prekey: KeyPair,
    /// Nonce to sign, present for non-current devices
    pub challenge_nonce: Option<[u8; 32]>,
}

/// Registry of devices and their trust state.
pub struct DeviceRegistry<E: Environment> {
    env: E,
    config: RegistryConfig,
    devices: HashMap<DeviceId, DeviceRecord>,
    challenges: HashMap<DeviceId, TrustChallenge>,
}

impl<E: Environment> DeviceRegistry<E> {
    /// Create an empty registry.
    pub fn new(env: E, config: RegistryConfig) -> Self {
        Self { env, config, devices: HashMap::new(), challenges: HashMap::new() }
    }

    fn allocate_device_id(&self) -> DeviceId {
        loop {
            let candidate = self.env.random_u64();
            if !self.devices.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Register a device for a user.
    ///
    /// The current device is trusted at creation. Any other device gets a
    /// signed-nonce challenge it must answer within the challenge TTL.
    pub fn register_device(
        &mut self,
        user_id: UserId,
        name: &str,
        is_current: bool,
    ) -> Result<RegisteredDevice, EngineError> {
        let owned = self.devices.values().filter(|d| d.user_id == user_id).count();
        if owned >= self.config.max_devices {
            return Err(EngineError::DeviceLimitReached { user_id, max: self.config.max_devices });
        }

        let device_id = self.allocate_device_id();
        let signing = SigningIdentity::from_seed(self.env.random_seed());
        let prekey = KeyPair::from_seed(self.env.random_seed());
        let now_ms = self.env.now_ms();

        let (status, trust_level) = if is_current {
            (DeviceStatus::Verified, TRUST_CURRENT)
        } else {
            (DeviceStatus::Pending, TRUST_PENDING)
        };

        self.devices.insert(
            device_id,
            DeviceRecord {
                device_id,
                user_id,
                name: name.to_string(),
                signing_public: signing.public_bytes(),
                prekey_public: prekey.public_bytes(),
                trust_level,
                status,
                registered_at_ms: now_ms,
                last_seen_ms: now_ms,
                is_current,
            },
        );

        let challenge_nonce = if is_current {
            None
        } else {
            let mut nonce = [0u8; 32];
            self.env.random_bytes(&mut nonce);
            self.challenges.insert(
                device_id,
                TrustChallenge {
                    nonce,
                    expected_digest: challenge_digest(&nonce, &signing.public_bytes()),
                    expires_at_ms: now_ms
                        .saturating_add(self.config.challenge_ttl.as_millis() as u64),
                    kind: ChallengeKind::SignedNonce,
                },
            );
            Some(nonce)
        };

        tracing::info!(device_id, user_id, is_current, "registered device");
        Ok(RegisteredDevice { device_id, signing, prekey, challenge_nonce })
    }

    /// Record a peer's device under its canonical id.
    ///
    /// Device ids are allocated by the owning user's side and published
    /// alongside the device's public keys; importing keeps both parties in
    /// one id space, so fan-out maps built by the sender resolve directly
    /// on the recipient. No secret material exists locally. The device
    /// starts `Pending` with a signed-nonce challenge the owning device
    /// must answer, exactly like a locally registered companion.
    ///
    /// Returns the challenge nonce, or `None` when the id was already
    /// known (re-announcements are no-ops).
    pub fn import_device(
        &mut self,
        user_id: UserId,
        device_id: DeviceId,
        name: &str,
        signing_public: [u8; 32],
        prekey_public: [u8; 32],
    ) -> Result<Option<[u8; 32]>, EngineError> {
        if self.devices.contains_key(&device_id) {
            return Ok(None);
        }

        let owned = self.devices.values().filter(|d| d.user_id == user_id).count();
        if owned >= self.config.max_devices {
            return Err(EngineError::DeviceLimitReached { user_id, max: self.config.max_devices });
        }

        let now_ms = self.env.now_ms();
        self.devices.insert(
            device_id,
            DeviceRecord {
                device_id,
                user_id,
                name: name.to_string(),
                signing_public,
                prekey_public,
                trust_level: TRUST_PENDING,
                status: DeviceStatus::Pending,
                registered_at_ms: now_ms,
                last_seen_ms: now_ms,
                is_current: false,
            },
        );

        let mut nonce = [0u8; 32];
        self.env.random_bytes(&mut nonce);
        self.challenges.insert(
            device_id,
            TrustChallenge {
                nonce,
                expected_digest: challenge_digest(&nonce, &signing_public),
                expires_at_ms: now_ms.saturating_add(self.config.challenge_ttl.as_millis() as u64),
                kind: ChallengeKind::SignedNonce,
            },
        );

        tracing::info!(device_id, user_id, "imported device");
        Ok(Some(nonce))
    }

    /// Answer a device's trust challenge.
    ///
    /// `response` is an Ed25519 signature over the challenge nonce. A good
    /// signature promotes the device to `Verified` with elevated trust; a
    /// bad one marks it `Rejected`; answering after the TTL marks it
    /// `Expired`. The challenge is deleted in every case.
    pub fn verify_device(
        &mut self,
        device_id: DeviceId,
        response: &[u8],
    ) -> Result<bool, EngineError> {
        let record = self
            .devices
            .get_mut(&device_id)
            .ok_or(EngineError::DeviceNotFound { device_id })?;

        let challenge = self
            .challenges
            .remove(&device_id)
            .ok_or(EngineError::NoPendingChallenge { device_id })?;

        let now_ms = self.env.now_ms();
        if now_ms > challenge.expires_at_ms {
            record.status = DeviceStatus::Expired;
            tracing::warn!(device_id, "trust challenge expired");
            return Ok(false);
        }

        let good = verify_detached(&record.signing_public, &challenge.nonce, response)
            .unwrap_or(false);

        if good {
            record.status = DeviceStatus::Verified;
            record.trust_level = TRUST_VERIFIED;
            record.last_seen_ms = now_ms;
            tracing::info!(device_id, "device verified");
        } else {
            record.status = DeviceStatus::Rejected;
            tracing::warn!(device_id, "trust challenge rejected");
        }
        Ok(good)
    }

    /// Delete a device record.
    ///
    /// The current device cannot be revoked. Returns the owning user so
    /// the caller can rotate every conversation key shared with that user.
    pub fn revoke_device(&mut self, device_id: DeviceId) -> Result<UserId, EngineError> {
        let record = self
            .devices
            .get(&device_id)
            .ok_or(EngineError::DeviceNotFound { device_id })?;

        if record.is_current {
            return Err(EngineError::CannotRevokeCurrentDevice { device_id });
        }

        let user_id = record.user_id;
        self.devices.remove(&device_id);
        self.challenges.remove(&device_id);
        tracing::info!(device_id, user_id, "device revoked");
        Ok(user_id)
    }

    /// Update a device's last-seen timestamp.
    pub fn touch(&mut self, device_id: DeviceId) -> Result<(), EngineError> {
        let now_ms = self.env.now_ms();
        let record = self
            .devices
            .get_mut(&device_id)
            .ok_or(EngineError::DeviceNotFound { device_id })?;
        record.last_seen_ms = now_ms;
        Ok(())
    }

    /// Verified devices of a user, for fan-out target resolution.
    pub fn verified_devices(&self, user_id: UserId) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| d.user_id == user_id && d.status == DeviceStatus::Verified)
            .map(|d| d.device_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Verified non-current devices of a user, the key-sync targets.
    pub fn trusted_sync_targets(&self, user_id: UserId) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| d.user_id == user_id && d.status == DeviceStatus::Verified && !d.is_current)
            .map(|d| d.device_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Expire challenges past their TTL, marking their devices `Expired`.
    ///
    /// Returns how many challenges were dropped.
    pub fn expire_challenges(&mut self) -> usize {
        let now_ms = self.env.now_ms();
        let expired: Vec<DeviceId> = self
            .challenges
            .iter()
            .filter(|(_, c)| now_ms > c.expires_at_ms)
            .map(|(&id, _)| id)
            .collect();

        for device_id in &expired {
            self.challenges.remove(device_id);
            if let Some(record) = self.devices.get_mut(device_id) {
                if record.status == DeviceStatus::Pending {
                    record.status = DeviceStatus::Expired;
                }
            }
            tracing::debug!(device_id, "expired trust challenge");
        }
        expired.len()
    }

    /// A device's record, if registered.
    pub fn device(&self, device_id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }

    /// Number of devices registered to a user.
    pub fn device_count(&self, user_id: UserId) -> usize {
        self.devices.values().filter(|d| d.user_id == user_id).count()
    }

    /// Number of outstanding challenges.
    pub fn pending_challenges(&self) -> usize {
        self.challenges.len()
    }
}
