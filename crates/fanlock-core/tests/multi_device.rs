//! Multi-device fan-out, trust lifecycle, and persistence properties.
//!
//! These tests verify critical invariants:
//! - One logical message produces an independent ciphertext per device,
//!   and no two devices can read each other's copy
//! - Fan-out degrades partially: one failing device never blocks the rest
//! - The per-user device cap is enforced at registration
//! - Revocation removes the device from every future fan-out and rotates
//!   the owner's sessions
//! - A directory persisted to a store resumes mid-conversation

use fanlock_core::{
    DirectoryConfig, EngineError, MAX_DEVICES, MemoryStore, MessagingContext, RegisteredDevice,
    SessionDirectory, SessionKey, env::test_utils::MockEnv,
};
use fanlock_crypto::KeyPair;

const CONV: u128 = 1;
const ALICE: u64 = 1;
const BOB: u64 = 2;
const SHARED: [u8; 32] = [5u8; 32];

fn context(seed: u64, user: u64) -> MessagingContext<MockEnv> {
    MessagingContext::new(MockEnv::seeded(seed), user, "primary")
        .expect("context creation should succeed")
}

/// Register, verify, and establish a session with `n` peer devices.
/// Returns the registrations so tests can drive the peers' own side.
fn establish_with_devices(
    ctx: &mut MessagingContext<MockEnv>,
    user: u64,
    n: usize,
) -> Vec<RegisteredDevice> {
    let local_device = ctx.device_id();
    let mut devices = Vec::new();
    for i in 0..n {
        let registered = ctx
            .registry_mut()
            .register_device(user, &format!("peer-{i}"), false)
            .expect("registration should succeed");
        let nonce = registered.challenge_nonce.expect("companion gets a challenge");
        let signature = registered.signing.sign(&nonce);
        assert!(ctx.verify_device(registered.device_id, &signature).expect("verify"));

        let key = SessionKey::new(CONV, user, registered.device_id);
        ctx.directory_mut()
            .complete_establishment(key, local_device, registered.prekey.public_bytes(), SHARED, 1)
            .expect("establishment should succeed");
        devices.push(registered);
    }
    devices
}

#[test]
fn fanout_produces_distinct_ciphertexts_per_device() {
    let mut alice = context(1, ALICE);
    let devices = establish_with_devices(&mut alice, BOB, 3);

    let fanout = alice.encrypt_for_devices(CONV, BOB, b"same words", None);
    assert!(fanout.failed.is_empty());
    assert_eq!(fanout.message.per_device.len(), 3);

    // INVARIANT: independent sessions, independent ciphertexts
    let bodies: Vec<_> = devices
        .iter()
        .map(|d| {
            let envelope =
                fanout.message.per_device.get(&d.device_id).expect("entry per device");
            envelope.message.parts().1.ciphertext.clone()
        })
        .collect();
    assert_ne!(bodies[0], bodies[1]);
    assert_ne!(bodies[1], bodies[2]);
    assert_ne!(bodies[0], bodies[2]);
}

#[test]
fn fanout_partial_failure_never_blocks_other_devices() {
    let mut alice = context(1, ALICE);
    establish_with_devices(&mut alice, BOB, 2);

    // Verified but never established: encryption for it must fail alone
    let stray = alice
        .registry_mut()
        .register_device(BOB, "no-session", false)
        .expect("registration should succeed");
    let nonce = stray.challenge_nonce.expect("challenge");
    let signature = stray.signing.sign(&nonce);
    alice.verify_device(stray.device_id, &signature).expect("verify");

    let fanout = alice.encrypt_for_devices(CONV, BOB, b"partial", None);

    assert_eq!(fanout.message.per_device.len(), 2);
    assert_eq!(fanout.failed.len(), 1);
    assert_eq!(fanout.failed[0].0, stray.device_id);
    assert!(matches!(fanout.failed[0].1, EngineError::NoSessionWithDevice { .. }));
}

#[test]
fn device_cap_is_enforced() {
    let mut alice = context(1, ALICE);

    for i in 0..MAX_DEVICES {
        alice
            .registry_mut()
            .register_device(BOB, &format!("bob-{i}"), false)
            .expect("registration under the cap should succeed");
    }

    let err = alice
        .registry_mut()
        .register_device(BOB, "one-too-many", false)
        .expect_err("registration over the cap must fail");
    assert!(matches!(
        err,
        EngineError::DeviceLimitReached { user_id: BOB, max } if max == MAX_DEVICES
    ));
}

#[test]
fn revoked_device_leaves_every_future_fanout() {
    let mut alice = context(1, ALICE);
    let devices = establish_with_devices(&mut alice, BOB, 2);
    let ids: Vec<u64> = devices.iter().map(|d| d.device_id).collect();

    // Each peer answers once so every session has a rotatable chain
    let hello = alice.encrypt_for_devices(CONV, BOB, b"hello", None);
    for (i, device) in devices.iter().enumerate() {
        let envelope = hello.message.per_device.get(&device.device_id).expect("entry");
        let mut peer =
            SessionDirectory::new(MockEnv::seeded(50 + i as u64), DirectoryConfig::default());
        let from_alice = SessionKey::new(CONV, ALICE, alice.device_id());
        let (peer_sid, _) = peer
            .accept_inbound(from_alice, device.device_id, SHARED, device.prekey.clone(), envelope)
            .expect("peer-side establishment");
        let reply = peer.send_message(peer_sid, b"ack").expect("reply");

        let key = SessionKey::new(CONV, BOB, device.device_id);
        let sid = alice.directory().session_for(&key).expect("session exists");
        alice.directory_mut().receive_message(sid, &reply).expect("receive reply");
    }

    let rotated = alice.revoke_device(ids[0]).expect("revocation should succeed");
    assert_eq!(rotated, 2, "every answered session with the owner rotates");
    assert!(alice.registry().device(ids[0]).is_none());

    let fanout = alice.encrypt_for_devices(CONV, BOB, b"after revocation", None);
    assert!(fanout.failed.is_empty());
    assert_eq!(fanout.message.per_device.len(), 1);
    assert!(!fanout.message.per_device.contains_key(&ids[0]));
    assert!(fanout.message.per_device.contains_key(&ids[1]));
}

#[test]
fn current_device_cannot_be_revoked() {
    let mut alice = context(1, ALICE);
    let own = alice.device_id();

    let err = alice.revoke_device(own).expect_err("self-revocation must fail");
    assert!(matches!(err, EngineError::CannotRevokeCurrentDevice { .. }));
    assert!(alice.registry().device(own).is_some());
}

#[test]
fn unverified_companion_is_not_a_sync_target() {
    let mut alice = context(1, ALICE);
    let companion = alice.register_companion("tablet").expect("registration");

    assert!(alice.registry().trusted_sync_targets(ALICE).is_empty());

    let nonce = companion.challenge_nonce.expect("challenge");
    let signature = companion.signing.sign(&nonce);
    assert!(alice.verify_device(companion.device_id, &signature).expect("verify"));

    assert_eq!(alice.registry().trusted_sync_targets(ALICE), vec![companion.device_id]);
}

#[test]
fn wrong_signature_rejects_the_challenge() {
    let mut alice = context(1, ALICE);
    let companion = alice.register_companion("tablet").expect("registration");
    let nonce = companion.challenge_nonce.expect("challenge");

    // Signed by the wrong identity
    let impostor = alice.register_companion("impostor").expect("registration");
    let signature = impostor.signing.sign(&nonce);

    assert!(!alice.verify_device(companion.device_id, &signature).expect("verify call"));
    assert!(alice.registry().trusted_sync_targets(ALICE).is_empty());
}

#[test]
fn directory_resumes_from_store_mid_conversation() {
    let env = MockEnv::seeded(7);
    let mut alice = SessionDirectory::new(env.clone(), DirectoryConfig::default());
    let mut bob = SessionDirectory::new(MockEnv::seeded(8), DirectoryConfig::default());
    let prekey = KeyPair::from_seed([3u8; 32]);

    let to_bob = SessionKey::new(CONV, BOB, 20);
    let alice_sid = alice
        .complete_establishment(to_bob, 10, prekey.public_bytes(), SHARED, 0)
        .expect("establishment");
    let first = alice.send_message(alice_sid, b"before restart").expect("send");

    let from_alice = SessionKey::new(CONV, ALICE, 10);
    let (bob_sid, plaintext) =
        bob.accept_inbound(from_alice, 20, SHARED, prekey, &first).expect("accept");
    assert_eq!(plaintext, b"before restart");

    // Persist alice, drop her, reload from the store
    let store = MemoryStore::new();
    alice.persist(&store).expect("persist should succeed");
    drop(alice);

    let mut resumed = SessionDirectory::load(env, DirectoryConfig::default(), &store)
        .expect("load should succeed")
        .expect("store holds a directory");
    assert_eq!(resumed.session_for(&to_bob), Some(alice_sid));

    // The resumed ratchet continues exactly where it stopped
    let second = resumed.send_message(alice_sid, b"after restart").expect("send");
    assert_eq!(bob.receive_message(bob_sid, &second).expect("receive"), b"after restart");

    let reply = bob.send_message(bob_sid, b"welcome back").expect("send");
    assert_eq!(resumed.receive_message(alice_sid, &reply).expect("receive"), b"welcome back");
}
