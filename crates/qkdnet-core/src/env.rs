//! Clock and randomness seam.
//!
//! KMEs and the controller need three things from the outside world: a
//! monotonic clock for TTLs and capacity windows, a wall clock for block
//! timestamps, and randomness for identifiers. Routing all of them through
//! this trait lets the harness replay a whole network from a seed.

use std::time::Duration;

/// Time and randomness as seen by a KME or the controller.
///
/// # Contract
///
/// - `now` is monotonic; TTL and window arithmetic subtracts instants
/// - `random_bytes` draws from the OS CSPRNG outside of simulation
/// - No method fails; an implementation that cannot honour the contract
///   aborts the process
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`; the simulation harness uses a
    /// manually advanced virtual instant.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Monotonic now. Never earlier than a previous call.
    fn now(&self) -> Self::Instant;

    /// Waits for `duration`. Nodes only; drivers never wait.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills `buffer` with random bytes. Seeded environments replay the
    /// same stream.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Seconds since the Unix epoch.
    ///
    /// Block arrival timestamps and session creation times use this clock,
    /// since they are compared across processes.
    fn wall_clock_secs(&self) -> u64;

    /// Sixteen random bytes, big-endian.
    ///
    /// Every identifier in the system (KMEs, links, blocks, keys, sessions)
    /// is drawn from this.
    fn random_u128(&self) -> u128 {
        let mut raw = [0u8; 16];
        self.random_bytes(&mut raw);
        u128::from_be_bytes(raw)
    }
}
