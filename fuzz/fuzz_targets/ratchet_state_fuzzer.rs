//! Fuzz target for the ratchet engine state machine
//!
//! # Strategy
//!
//! Drives an engine pair through arbitrary interleavings of sends,
//! out-of-order deliveries, replays, tampered ciphertexts, and proactive
//! rotations.
//!
//! # Invariants
//!
//! - The engine never panics
//! - A genuine message delivered within the skip window decrypts to the
//!   plaintext that was sent; past the window it fails with the skip error
//! - A tampered or replayed message fails and leaves the counters exactly
//!   where they were
//! - Rotation never breaks the conversation

#![no_main]

use arbitrary::Arbitrary;
use fanlock_core::{EngineError, Envelope, RatchetEngine, env::test_utils::MockEnv};
use fanlock_crypto::KeyPair;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    SendToBob { payload: u16 },
    SendToAlice { payload: u16 },
    DeliverToBob { pick: u8, tamper: bool },
    DeliverToAlice { pick: u8, tamper: bool },
    ReplayLastToBob,
    RotateAlice,
    RotateBob,
}

fuzz_target!(|input: (u64, Vec<Op>)| {
    let (seed, ops) = input;

    let mut alice = RatchetEngine::new(MockEnv::seeded(seed));
    let mut bob = RatchetEngine::new(MockEnv::seeded(seed.wrapping_add(1)));
    let prekey = KeyPair::from_seed([9u8; 32]);
    let shared = [7u8; 32];

    alice
        .initialize_as_sender(1, 1, 10, 20, prekey.public_bytes(), shared, 0)
        .unwrap();
    let first = alice.encrypt(1, b"hello").unwrap();
    bob.initialize_as_receiver(1, 1, 20, 10, shared, prekey, &first).unwrap();

    let mut to_bob: Vec<(Envelope, Vec<u8>)> = Vec::new();
    let mut to_alice: Vec<(Envelope, Vec<u8>)> = Vec::new();
    let mut last_delivered_to_bob: Option<Envelope> = None;

    for op in ops {
        match op {
            Op::SendToBob { payload } => {
                let plaintext = payload.to_be_bytes().to_vec();
                let envelope = alice.encrypt(1, &plaintext).unwrap();
                to_bob.push((envelope, plaintext));
            }
            Op::SendToAlice { payload } => {
                let plaintext = payload.to_be_bytes().to_vec();
                let envelope = bob.encrypt(1, &plaintext).unwrap();
                to_alice.push((envelope, plaintext));
            }
            Op::DeliverToBob { pick, tamper } => {
                deliver(&mut bob, &mut to_bob, pick, tamper, &mut last_delivered_to_bob);
            }
            Op::DeliverToAlice { pick, tamper } => {
                deliver(&mut alice, &mut to_alice, pick, tamper, &mut None);
            }
            Op::ReplayLastToBob => {
                if let Some(envelope) = &last_delivered_to_bob {
                    let before = bob.counters(1).unwrap();
                    assert!(bob.decrypt(1, envelope).is_err(), "replay must fail");
                    assert_eq!(bob.counters(1).unwrap(), before, "replay must not move state");
                }
            }
            Op::RotateAlice => {
                alice.rotate(1).unwrap();
            }
            Op::RotateBob => {
                bob.rotate(1).unwrap();
            }
        }
    }

    // Everything still pending decrypts eventually unless the skip window
    // was exceeded
    for (envelope, plaintext) in to_bob {
        check_final_delivery(&mut bob, &envelope, &plaintext);
    }
    for (envelope, plaintext) in to_alice {
        check_final_delivery(&mut alice, &envelope, &plaintext);
    }
});

fn deliver(
    engine: &mut RatchetEngine<MockEnv>,
    pending: &mut Vec<(Envelope, Vec<u8>)>,
    pick: u8,
    tamper: bool,
    last_delivered: &mut Option<Envelope>,
) {
    if pending.is_empty() {
        return;
    }
    let index = pick as usize % pending.len();

    if tamper {
        // Flip one ciphertext byte on a copy; the genuine message stays
        // queued and must remain decryptable afterwards
        let mut forged = pending[index].0.clone();
        let body = match &mut forged.message {
            fanlock_core::RatchetMessage::Prekey { body, .. }
            | fanlock_core::RatchetMessage::Chained { body } => body,
        };
        if body.ciphertext.is_empty() {
            return;
        }
        body.ciphertext[0] ^= 0x01;

        let before = engine.counters(1).unwrap();
        assert!(engine.decrypt(1, &forged).is_err(), "tampered message must fail");
        assert_eq!(engine.counters(1).unwrap(), before, "tamper must not move state");
        return;
    }

    let (envelope, plaintext) = pending.swap_remove(index);
    match engine.decrypt(1, &envelope) {
        Ok(decrypted) => {
            assert_eq!(decrypted, plaintext, "plaintext must round-trip");
            *last_delivered = Some(envelope);
        }
        Err(EngineError::TooManySkippedMessages { .. }) => {}
        Err(e) => panic!("genuine message rejected: {e}"),
    }
}

fn check_final_delivery(engine: &mut RatchetEngine<MockEnv>, envelope: &Envelope, plaintext: &[u8]) {
    match engine.decrypt(1, envelope) {
        Ok(decrypted) => assert_eq!(decrypted, plaintext),
        Err(EngineError::TooManySkippedMessages { .. } | EngineError::DecryptionFailed { .. }) => {
            // Past the skip window, or its buffered key was dropped when an
            // overflow rejected the whole batch
        }
        Err(e) => panic!("genuine message rejected: {e}"),
    }
}
