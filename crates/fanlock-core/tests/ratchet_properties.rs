//! End-to-end ratchet and session-lifecycle properties.
//!
//! These tests verify critical invariants:
//! - Round trip holds for arbitrary plaintexts
//! - In-order and out-of-order delivery leave the counters right
//! - The skip window bound is exact (a gap of `MAX_SKIP` succeeds,
//!   one more fails)
//! - Establishment is at-most-once per (conversation, user, device)
//! - A stale full-state snapshot stops decrypting after one fresh
//!   round trip (post-compromise healing)

use std::time::Duration;

use fanlock_core::{
    DirectoryConfig, EngineError, MAX_SKIP, RatchetEngine, SessionDirectory, SessionKey,
    env::test_utils::MockEnv,
};
use fanlock_crypto::KeyPair;
use proptest::prelude::*;

const CONV: u128 = 0x1234_5678_9abc_def0;
const ALICE_DEV: u64 = 10;
const BOB_DEV: u64 = 20;
const SHARED: [u8; 32] = [7u8; 32];

/// Engine pair with session id 1 on both sides, first message delivered.
fn engine_pair() -> (RatchetEngine<MockEnv>, RatchetEngine<MockEnv>) {
    let mut alice = RatchetEngine::new(MockEnv::seeded(1));
    let mut bob = RatchetEngine::new(MockEnv::seeded(2));
    let prekey = KeyPair::from_seed([9u8; 32]);

    alice
        .initialize_as_sender(1, CONV, ALICE_DEV, BOB_DEV, prekey.public_bytes(), SHARED, 0)
        .expect("sender init should succeed");
    let first = alice.encrypt(1, b"hello").expect("first encrypt should succeed");
    bob.initialize_as_receiver(1, CONV, BOB_DEV, ALICE_DEV, SHARED, prekey, &first)
        .expect("receiver init should succeed");

    (alice, bob)
}

#[test]
fn round_trip_for_varied_plaintexts() {
    let (mut alice, mut bob) = engine_pair();

    let cases: [&[u8]; 4] = [b"", b"a", b"hello world", &[0xFFu8; 4096]];
    for plaintext in cases {
        let envelope = alice.encrypt(1, plaintext).expect("encrypt should succeed");
        let decrypted = bob.decrypt(1, &envelope).expect("decrypt should succeed");
        assert_eq!(decrypted, plaintext);
    }
}

#[test]
fn in_order_delivery_leaves_nr_at_two() {
    let mut alice = RatchetEngine::new(MockEnv::seeded(1));
    let mut bob = RatchetEngine::new(MockEnv::seeded(2));
    let prekey = KeyPair::from_seed([9u8; 32]);

    alice
        .initialize_as_sender(1, CONV, ALICE_DEV, BOB_DEV, prekey.public_bytes(), SHARED, 0)
        .expect("sender init should succeed");

    // "hello" is index 0, "world" is index 1
    let hello = alice.encrypt(1, b"hello").expect("encrypt hello");
    let world = alice.encrypt(1, b"world").expect("encrypt world");

    let plaintext = bob
        .initialize_as_receiver(1, CONV, BOB_DEV, ALICE_DEV, SHARED, prekey, &hello)
        .expect("receiver init should succeed");
    assert_eq!(plaintext, b"hello");
    assert_eq!(bob.decrypt(1, &world).expect("decrypt world"), b"world");

    // INVARIANT: two in-order messages leave the receive counter at 2
    let counters = bob.counters(1).expect("session should exist");
    assert_eq!(counters.nr, 2);
    assert_eq!(counters.skipped, 0);
}

#[test]
fn out_of_order_2_0_1_buffers_and_evicts() {
    let (mut alice, mut bob) = engine_pair();

    let m0 = alice.encrypt(1, b"zero").expect("encrypt 0");
    let m1 = alice.encrypt(1, b"one").expect("encrypt 1");
    let m2 = alice.encrypt(1, b"two").expect("encrypt 2");

    // Message 2 first: keys for 0 and 1 get buffered
    assert_eq!(bob.decrypt(1, &m2).expect("decrypt 2"), b"two");
    assert_eq!(bob.counters(1).expect("counters").skipped, 2);

    // 0 and 1 decrypt from the buffer and are evicted after use
    assert_eq!(bob.decrypt(1, &m0).expect("decrypt 0"), b"zero");
    assert_eq!(bob.decrypt(1, &m1).expect("decrypt 1"), b"one");
    assert_eq!(bob.counters(1).expect("counters").skipped, 0);

    // A buffered key is single-use: replaying fails
    assert!(matches!(bob.decrypt(1, &m0), Err(EngineError::DecryptionFailed { .. })));
}

#[test]
fn skip_window_bound_is_exact() {
    let (mut alice, mut bob) = engine_pair();

    // Receive counter sits at 1; dropping MAX_SKIP messages puts the next
    // one at index 1 + MAX_SKIP, the largest acceptable gap
    for _ in 0..MAX_SKIP {
        alice.encrypt(1, b"dropped").expect("encrypt dropped");
    }
    let at_bound = alice.encrypt(1, b"at bound").expect("encrypt at bound");
    assert_eq!(bob.decrypt(1, &at_bound).expect("gap of MAX_SKIP should succeed"), b"at bound");

    // INVARIANT: the buffer holds one key per dropped message, exactly
    // MAX_SKIP of them
    assert_eq!(bob.counters(1).expect("counters").skipped, MAX_SKIP as usize);
}

#[test]
fn skip_window_overflow_fails_cleanly() {
    let (mut alice, mut bob) = engine_pair();

    for _ in 0..=MAX_SKIP {
        alice.encrypt(1, b"dropped").expect("encrypt dropped");
    }
    let past_bound = alice.encrypt(1, b"past bound").expect("encrypt past bound");

    let before = bob.counters(1).expect("counters");
    let result = bob.decrypt(1, &past_bound);
    assert!(matches!(result, Err(EngineError::TooManySkippedMessages { .. })));

    // INVARIANT: a rejected message leaves the ratchet untouched
    assert_eq!(bob.counters(1).expect("counters"), before);
}

#[test]
fn establishment_is_at_most_once() {
    let env = MockEnv::seeded(3);
    let mut directory = SessionDirectory::new(env, DirectoryConfig::default());

    // Two racing callers observe the same reserved id
    let first = directory.establish(CONV, 2, Some(BOB_DEV));
    let second = directory.establish(CONV, 2, Some(BOB_DEV));
    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.session_id, second.session_id);

    let prekey = KeyPair::from_seed([9u8; 32]);
    let key = SessionKey::new(CONV, 2, BOB_DEV);
    let completed = directory
        .complete_establishment(key, ALICE_DEV, prekey.public_bytes(), SHARED, 0)
        .expect("completion should succeed");
    assert_eq!(completed, first.session_id);

    // INVARIANT: exactly one ratchet state exists for the key
    assert_eq!(directory.engine().len(), 1);

    // Completing again changes nothing
    let again = directory
        .complete_establishment(key, ALICE_DEV, prekey.public_bytes(), SHARED, 0)
        .expect("repeat completion should be idempotent");
    assert_eq!(again, completed);
    assert_eq!(directory.engine().len(), 1);
}

#[test]
fn skew_and_age_guards_hold() {
    let bob_env = MockEnv::seeded(2);
    let mut alice = SessionDirectory::new(MockEnv::seeded(1), DirectoryConfig::default());
    let mut bob = SessionDirectory::new(bob_env.clone(), DirectoryConfig::default());
    let prekey = KeyPair::from_seed([9u8; 32]);

    let to_bob = SessionKey::new(CONV, 2, BOB_DEV);
    let alice_sid = alice
        .complete_establishment(to_bob, ALICE_DEV, prekey.public_bytes(), SHARED, 0)
        .expect("establishment should succeed");
    let first = alice.send_message(alice_sid, b"hi").expect("send should succeed");

    let from_alice = SessionKey::new(CONV, 1, ALICE_DEV);
    let (bob_sid, _) = bob
        .accept_inbound(from_alice, BOB_DEV, SHARED, prekey, &first)
        .expect("inbound establishment should succeed");

    // Future-dated beyond the skew tolerance: rejected, transient
    let mut future = alice.send_message(alice_sid, b"future").expect("send");
    future.sent_at_ms += 6 * 60 * 1000;
    let err = bob.receive_message(bob_sid, &future).expect_err("future message must fail");
    assert!(matches!(err, EngineError::MessageFromFuture { .. }));
    assert!(err.is_transient());

    // Older than the age limit: rejected, fatal
    let stale = alice.send_message(alice_sid, b"stale").expect("send");
    bob_env.advance(Duration::from_secs(8 * 24 * 60 * 60));
    let err = bob.receive_message(bob_sid, &stale).expect_err("stale message must fail");
    assert!(matches!(err, EngineError::MessageTooOld { .. }));
    assert!(!err.is_transient());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_round_trip_for_any_plaintext(
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        seed in any::<u64>(),
    ) {
        let mut alice = RatchetEngine::new(MockEnv::seeded(seed));
        let mut bob = RatchetEngine::new(MockEnv::seeded(seed.wrapping_add(1)));
        let prekey = KeyPair::from_seed([9u8; 32]);

        alice
            .initialize_as_sender(1, CONV, ALICE_DEV, BOB_DEV, prekey.public_bytes(), SHARED, 0)
            .expect("sender init");
        let first = alice.encrypt(1, b"hello").expect("first encrypt");
        bob.initialize_as_receiver(1, CONV, BOB_DEV, ALICE_DEV, SHARED, prekey, &first)
            .expect("receiver init");

        let envelope = alice.encrypt(1, &plaintext).expect("encrypt");
        prop_assert_eq!(bob.decrypt(1, &envelope).expect("decrypt"), plaintext);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_any_delivery_order_decrypts_fully(
        (count, order) in (2usize..12).prop_flat_map(|n| {
            (Just(n), Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
        }),
    ) {
        let (mut alice, mut bob) = engine_pair();

        let batch: Vec<_> = (0..count)
            .map(|i| {
                let plaintext = format!("message {i}").into_bytes();
                let envelope = alice.encrypt(1, &plaintext).expect("encrypt");
                (envelope, plaintext)
            })
            .collect();

        for &i in &order {
            let (envelope, plaintext) = &batch[i];
            prop_assert_eq!(&bob.decrypt(1, envelope).expect("decrypt"), plaintext);
        }

        // Every buffered key was consumed
        prop_assert_eq!(bob.counters(1).expect("counters").skipped, 0);
    }
}

#[test]
fn stale_snapshot_stops_decrypting_after_heal() {
    let (mut alice, mut bob) = engine_pair();

    // Establish the duplex
    let reply = bob.encrypt(1, b"ack").expect("encrypt ack");
    alice.decrypt(1, &reply).expect("decrypt ack");

    // Full bob state leaks here
    let leaked = bob.snapshot(1).expect("snapshot should succeed");

    // One fresh round trip after the leak: bob contributes entropy the
    // snapshot never saw
    alice.rotate(1).expect("rotate should succeed");
    let m1 = alice.encrypt(1, b"post-leak").expect("encrypt");
    bob.decrypt(1, &m1).expect("decrypt");
    let fresh = bob.encrypt(1, b"fresh key").expect("encrypt");
    alice.decrypt(1, &fresh).expect("decrypt");

    let m2 = alice.encrypt(1, b"healed").expect("encrypt");

    // The live device reads it; the leaked snapshot cannot
    let mut stolen = RatchetEngine::new(MockEnv::seeded(99));
    stolen.restore(leaked);
    assert!(stolen.decrypt(1, &m2).is_err(), "leaked snapshot must not decrypt post-heal traffic");

    assert_eq!(bob.decrypt(1, &m2).expect("live decrypt"), b"healed");
}
