//! Simulated environment: virtual time and seeded randomness.
//!
//! Time only moves when a test advances it, or when something sleeps.
//! Every clone shares the same clock and RNG, so a whole network built
//! from one `SimEnv` replays identically for the same seed.

#![allow(clippy::disallowed_types, reason = "Shared simulation state")]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use qkdnet_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Wall-clock second the simulation starts at.
pub const SIM_EPOCH_SECS: u64 = 1_700_000_000;

/// Deterministic environment.
#[derive(Clone, Debug)]
pub struct SimEnv {
    clock_ms: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Environment seeded with zero.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            clock_ms: Arc::new(AtomicU64::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        self.clock_ms.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Virtual time since the simulation started.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.clock_ms.load(Ordering::SeqCst))
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        tokio::task::yield_now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("sim rng poisoned").fill_bytes(buffer);
    }

    fn wall_clock_secs(&self) -> u64 {
        SIM_EPOCH_SECS + self.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(9);
        let b = SimEnv::with_seed(9);
        assert_eq!(a.random_u128(), b.random_u128());
    }

    #[test]
    fn clones_share_the_clock() {
        let env = SimEnv::new();
        let clone = env.clone();
        env.advance(Duration::from_millis(1_500));

        assert_eq!(clone.now(), Duration::from_millis(1_500));
        assert_eq!(clone.wall_clock_secs(), SIM_EPOCH_SECS + 1);
    }
}
