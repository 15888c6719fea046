//! Simulation environment on tokio's virtual clock.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use studysync_core::env::Environment;

/// Wall-clock origin of the simulation, 2025-06-15T00:00:00Z.
const SIM_EPOCH_SECONDS: i64 = 1_749_945_600;

/// Environment whose monotonic time is tokio's [`tokio::time::Instant`].
///
/// Under `#[tokio::test(start_paused = true)]` the runtime auto-advances
/// the clock when every task is idle, so sweeps and timeouts fire
/// deterministically without real waiting. The wall clock is derived from
/// the same virtual clock, anchored at a fixed simulation epoch.
#[derive(Clone)]
pub struct SimEnv {
    base: tokio::time::Instant,
    rng: Arc<Mutex<u64>>,
}

impl SimEnv {
    /// Create an environment with seed 1.
    pub fn new() -> Self {
        Self::with_seed(1)
    }

    /// Create an environment with a specific RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self { base: tokio::time::Instant::now(), rng: Arc::new(Mutex::new(seed.max(1))) }
    }

    fn rng(&self) -> MutexGuard<'_, u64> {
        // A poisoned lock only means a test thread panicked; the state
        // itself is still usable.
        self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.base;
        DateTime::<Utc>::UNIX_EPOCH
            + TimeDelta::seconds(SIM_EPOCH_SECONDS)
            + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::zero())
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let mut state = self.rng();
        for byte in buffer.iter_mut() {
            // xorshift64
            *state ^= *state << 13;
            *state ^= *state >> 7;
            *state ^= *state << 17;
            *byte = (*state & 0xff) as u8;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use studysync_core::env::Environment;

    use super::SimEnv;

    #[tokio::test(start_paused = true)]
    async fn wall_clock_follows_virtual_time() {
        let env = SimEnv::new();
        let before = env.wall_clock();

        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!((env.wall_clock() - before).num_seconds(), 30);
    }

    #[tokio::test]
    async fn seeded_randomness_is_deterministic() {
        let a = SimEnv::with_seed(7);
        let b = SimEnv::with_seed(7);

        assert_eq!(a.new_message_id(), b.new_message_id());
        assert_ne!(a.new_message_id(), a.new_message_id());
    }
}
