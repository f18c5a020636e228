//! Environment abstraction for deterministic testing.
//!
//! Decouples engine logic from system resources (time, randomness). Enables
//! deterministic tests with a virtual clock and seeded RNG, and production
//! use with real system resources.

use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now_ms()` never goes backwards within one environment instance
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time as Unix milliseconds.
    ///
    /// # Invariants
    ///
    /// - Subsequent calls must return values >= previous calls.
    fn now_ms(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait, and it should only be
    /// used by driver code (the maintenance scheduler), never by engine
    /// logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG in production
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a 32-byte seed for key material.
    fn random_seed(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// Generates a random `u64`.
    ///
    /// Convenience for session and device identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Useful for conversation and message identifiers.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Production environment using system time and cryptographic RNG.
///
/// Uses `SystemTime` for wall-clock time, `tokio::time::sleep` for async
/// sleeping, and getrandom for cryptographic randomness.
///
/// # Panics
///
/// Panics if the OS RNG fails. This is intentional - an engine without
/// functioning cryptographic randomness cannot operate securely. RNG
/// failure is extremely rare (indicates OS-level issues) and continuing
/// would compromise session IDs, nonces, and all key material.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - engine cannot operate securely");
    }
}

pub mod test_utils {
    //! Deterministic environment for tests and simulation.

    use std::sync::{Arc, Mutex, PoisonError};

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::{Duration, Environment};

    /// Fixed start of the virtual clock (2023-11-14T22:13:20Z).
    const MOCK_EPOCH_MS: u64 = 1_700_000_000_000;

    struct MockEnvInner {
        now_ms: u64,
        rng: ChaCha20Rng,
    }

    /// Deterministic environment with a virtual clock and a seeded RNG.
    ///
    /// Clones share the same clock and RNG stream, so a test can hold one
    /// handle to advance time while the engine holds another.
    #[derive(Clone)]
    pub struct MockEnv {
        inner: Arc<Mutex<MockEnvInner>>,
    }

    impl MockEnv {
        /// Environment seeded from a fixed default seed.
        #[must_use]
        pub fn new() -> Self {
            Self::seeded(0)
        }

        /// Environment with an explicit RNG seed.
        #[must_use]
        pub fn seeded(seed: u64) -> Self {
            Self {
                inner: Arc::new(Mutex::new(MockEnvInner {
                    now_ms: MOCK_EPOCH_MS,
                    rng: ChaCha20Rng::seed_from_u64(seed),
                })),
            }
        }

        /// Advance the virtual clock.
        pub fn advance(&self, duration: Duration) {
            let mut inner = self.lock();
            inner.now_ms = inner.now_ms.saturating_add(duration.as_millis() as u64);
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockEnvInner> {
            // A panicked test thread must not wedge every other handle
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        fn now_ms(&self) -> u64 {
            self.lock().now_ms
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            // Virtual sleep: advance the clock and resolve immediately.
            // Tests drive maintenance by calling the tick methods directly.
            self.advance(duration);
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.lock().rng.fill_bytes(buffer);
        }
    }
}
