//! Double Ratchet state and engine.
//!
//! One [`RatchetState`](state::RatchetState) exists per (conversation,
//! local device, remote device) triple, owned exclusively by the
//! [`RatchetEngine`]. The symmetric chain advances per message; the
//! asymmetric (DH) ratchet turns on every inbound public-key change,
//! re-keying both directions.

mod engine;
mod state;

pub use engine::{RatchetCounters, RatchetEngine};
pub use state::{MAX_SKIP, RatchetSnapshot, SkippedEntry};
