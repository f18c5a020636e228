//! Fuzz target for the device registry state machine
//!
//! # Strategy
//!
//! Arbitrary interleavings of registration, challenge verification with
//! good and bad signatures, revocation, heartbeats, and clock advances.
//!
//! # Invariants
//!
//! - The registry never panics
//! - No user ever holds more than the configured device cap
//! - The current device is never revocable
//! - A good signature within the TTL verifies; a bad one never does
//! - Expired challenges can no longer verify a device

#![no_main]

use std::collections::HashMap;
use std::time::Duration;

use arbitrary::Arbitrary;
use fanlock_core::{
    DeviceRegistry, DeviceStatus, EngineError, RegisteredDevice, RegistryConfig,
    env::test_utils::MockEnv,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Register { user: u8, current: bool },
    VerifyGood { pick: u8 },
    VerifyBad { pick: u8 },
    Revoke { pick: u8 },
    Touch { pick: u8 },
    AdvanceClock { minutes: u8 },
    ExpireChallenges,
}

fuzz_target!(|input: (u64, Vec<Op>)| {
    let (seed, ops) = input;

    let env = MockEnv::seeded(seed);
    let config = RegistryConfig::default();
    let max = config.max_devices;
    let mut registry = DeviceRegistry::new(env.clone(), config);

    let mut registered: Vec<RegisteredDevice> = Vec::new();
    let mut per_user: HashMap<u64, usize> = HashMap::new();

    for op in ops {
        match op {
            Op::Register { user, current } => {
                let user = u64::from(user % 4);
                match registry.register_device(user, "fuzzed", current) {
                    Ok(device) => {
                        *per_user.entry(user).or_insert(0) += 1;
                        assert!(per_user[&user] <= max, "device cap violated");
                        registered.push(device);
                    }
                    Err(EngineError::DeviceLimitReached { .. }) => {
                        assert_eq!(per_user.get(&user).copied().unwrap_or(0), max);
                    }
                    Err(e) => panic!("unexpected registration error: {e}"),
                }
            }
            Op::VerifyGood { pick } => {
                let Some(device) = pick_device(&registered, pick) else { continue };
                let Some(nonce) = device.challenge_nonce else { continue };
                let signature = device.signing.sign(&nonce);
                match registry.verify_device(device.device_id, &signature) {
                    Ok(true) => {
                        let record = registry.device(device.device_id).unwrap();
                        assert_eq!(record.status, DeviceStatus::Verified);
                    }
                    // Challenge already consumed, expired, or device revoked
                    Ok(false) | Err(_) => {}
                }
            }
            Op::VerifyBad { pick } => {
                let Some(device) = pick_device(&registered, pick) else { continue };
                let Some(nonce) = device.challenge_nonce else { continue };
                let mut forged = device.signing.sign(&nonce);
                forged[0] ^= 0x01;
                if let Ok(verified) = registry.verify_device(device.device_id, &forged) {
                    assert!(!verified, "forged signature must never verify");
                }
            }
            Op::Revoke { pick } => {
                let Some(device_id) = pick_device(&registered, pick).map(|d| d.device_id) else {
                    continue;
                };
                match registry.revoke_device(device_id) {
                    Ok(user) => {
                        let count = per_user.entry(user).or_insert(1);
                        *count = count.saturating_sub(1);
                        assert!(registry.device(device_id).is_none());
                        registered.retain(|d| d.device_id != device_id);
                    }
                    Err(EngineError::CannotRevokeCurrentDevice { .. }) => {
                        assert!(registry.device(device_id).is_some());
                    }
                    Err(EngineError::DeviceNotFound { .. }) => {}
                    Err(e) => panic!("unexpected revocation error: {e}"),
                }
            }
            Op::Touch { pick } => {
                if let Some(device) = pick_device(&registered, pick) {
                    let _ = registry.touch(device.device_id);
                }
            }
            Op::AdvanceClock { minutes } => {
                env.advance(Duration::from_secs(u64::from(minutes) * 60));
            }
            Op::ExpireChallenges => {
                let _ = registry.expire_challenges();
            }
        }
    }
});

fn pick_device(registered: &[RegisteredDevice], pick: u8) -> Option<&RegisteredDevice> {
    if registered.is_empty() {
        None
    } else {
        Some(&registered[pick as usize % registered.len()])
    }
}
