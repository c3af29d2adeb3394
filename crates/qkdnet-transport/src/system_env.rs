//! Real clocks and OS randomness for the service binaries.
//!
//! Both service binaries run on `SystemEnv`: real monotonic time for TTLs
//! and capacity windows, the wall clock for block timestamps, and OS
//! randomness for every identifier.

use std::time::Duration;

use qkdnet_core::Environment;

/// [`Environment`] backed by `std::time`, tokio timers and `getrandom`.
///
/// # Panics
///
/// Panics if the OS RNG fails. Identifiers drawn from a broken RNG could
/// collide across sessions, so the process stops instead.
#[derive(Clone, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// The environment. Stateless, so every instance is equivalent.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
