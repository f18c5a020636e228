//! Fuzz target for wire decoding
//!
//! Exercises the version-tagged CBOR decoders with:
//! - Malformed CBOR data
//! - Truncated and empty payloads
//! - Wrong or missing version bytes
//! - Valid encodings of one type fed to the other decoder
//!
//! The decoders must NEVER panic. Invalid input returns an error.

#![no_main]

use fanlock_core::{Envelope, FanoutMessage, message::decode_versioned, KeySyncNotice};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Envelope::decode(data);
    let _ = FanoutMessage::decode(data);
    let _: Result<KeySyncNotice, _> = decode_versioned(data);

    // Anything that decodes must re-encode
    if let Ok(envelope) = Envelope::decode(data) {
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }
});
