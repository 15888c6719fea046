//! Environment abstraction for deterministic testing.
//!
//! Decouples the client from system resources (monotonic time, wall clock,
//! randomness) so tests run with virtual time and seeded randomness while
//! production uses real system resources.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::MessageId;

/// Abstract environment providing time and randomness.
///
/// Implementations MUST guarantee that `now()` never goes backwards and
/// that `random_bytes()` uses cryptographically secure entropy in
/// production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; test environments
    /// use virtual time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time, used for message creation timestamps.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait and is used by the
    /// session multiplexer for the typing-expiry sweep, never by state
    /// machine logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generate a fresh client-side message identity.
    fn new_message_id(&self) -> MessageId {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        MessageId::new(Uuid::from_bytes(bytes))
    }
}

/// Production environment backed by system resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::rng().fill_bytes(buffer);
    }
}

pub mod test_utils {
    //! Deterministic environment for tests.

    use std::sync::{Arc, Mutex, MutexGuard};

    use super::{DateTime, Duration, Environment, Utc};

    struct MockState {
        /// Virtual elapsed time since construction.
        elapsed: Duration,
        /// Deterministic RNG state (xorshift).
        rng: u64,
    }

    /// Deterministic environment with settable virtual time.
    ///
    /// `sleep` never completes; tests drive time explicitly via
    /// [`MockEnv::advance`] and call expiry sweeps directly.
    #[derive(Clone)]
    pub struct MockEnv {
        base: std::time::Instant,
        state: Arc<Mutex<MockState>>,
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockEnv {
        /// Create an environment with seed 1 and zero elapsed time.
        pub fn new() -> Self {
            Self::with_seed(1)
        }

        /// Create an environment with a specific RNG seed.
        pub fn with_seed(seed: u64) -> Self {
            Self {
                base: std::time::Instant::now(),
                state: Arc::new(Mutex::new(MockState {
                    elapsed: Duration::ZERO,
                    rng: seed.max(1),
                })),
            }
        }

        /// Advance virtual time.
        pub fn advance(&self, duration: Duration) {
            self.lock().elapsed += duration;
        }

        fn lock(&self) -> MutexGuard<'_, MockState> {
            // A poisoned lock only means a test thread panicked; the state
            // itself is still usable.
            self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    impl std::fmt::Debug for MockEnv {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockEnv").finish_non_exhaustive()
        }
    }

    impl Environment for MockEnv {
        type Instant = std::time::Instant;

        fn now(&self) -> Self::Instant {
            self.base + self.lock().elapsed
        }

        fn wall_clock(&self) -> DateTime<Utc> {
            let elapsed = self.lock().elapsed;
            DateTime::<Utc>::UNIX_EPOCH
                + chrono::TimeDelta::from_std(elapsed).unwrap_or(chrono::TimeDelta::zero())
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::pending()
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut state = self.lock();
            for byte in buffer.iter_mut() {
                // xorshift64
                state.rng ^= state.rng << 13;
                state.rng ^= state.rng >> 7;
                state.rng ^= state.rng << 17;
                *byte = (state.rng & 0xff) as u8;
            }
        }
    }
}
