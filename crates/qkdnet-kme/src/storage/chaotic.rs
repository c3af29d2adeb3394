//! Chaotic storage wrapper for fault injection testing
//!
//! Randomly fails storage calls so tests can check that a failed key
//! generation leaves no partial state behind: every carve rolled back, no
//! orphan instruction rows, reference counts unchanged.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex, MutexGuard};

use qkdnet_core::{Block, BlockId, KeyId, KmeId, Ksid, LinkId, SessionRecord, message::KeyRow};

use super::{LinkRecord, LocalKey, Storage, StorageError};

/// Storage wrapper that injects failures at a fixed rate.
///
/// Delegates to an underlying storage implementation. The failure draw
/// happens before delegation, so a failed call never reaches the inner
/// store.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// Only mutations fail; reads always pass through.
    writes_only: bool,
    state: Arc<Mutex<ChaosState>>,
}

struct ChaosState {
    rng: ChaoticRng,
    operations: usize,
    failures: usize,
    /// Ordinal of one operation that fails regardless of the rate.
    fail_on: Option<usize>,
}

/// Linear congruential generator, reproducible from a seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner`, failing each call with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            writes_only: false,
            state: Arc::new(Mutex::new(ChaosState {
                rng: ChaoticRng { state: seed },
                operations: 0,
                failures: 0,
                fail_on: None,
            })),
        }
    }

    /// Restrict failures to mutating calls.
    pub fn writes_only(mut self) -> Self {
        self.writes_only = true;
        self
    }

    /// Fail exactly the operation that will be the `ordinal`-th one counted
    /// by [`Self::operation_count`].
    pub fn fail_on(&self, ordinal: usize) {
        self.lock().fail_on = Some(ordinal);
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.lock().operations
    }

    /// Number of operations that were failed on purpose.
    pub fn failure_count(&self) -> usize {
        self.lock().failures
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, ChaosState> {
        self.state.lock().expect("ChaosState mutex poisoned")
    }

    fn chaos(&self, operation: &'static str, write: bool) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.operations += 1;

        if state.fail_on == Some(state.operations) {
            state.failures += 1;
            return Err(StorageError::Io(format!("scheduled failure injection ({operation})")));
        }
        if self.writes_only && !write {
            return Ok(());
        }
        if state.rng.next() < self.failure_rate {
            state.failures += 1;
            return Err(StorageError::Io(format!("chaotic failure injection ({operation})")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn insert_block(&self, block: &Block) -> Result<bool, StorageError> {
        self.chaos("insert_block", true)?;
        self.inner.insert_block(block)
    }

    fn load_block(&self, block_id: BlockId) -> Result<Option<Block>, StorageError> {
        self.chaos("load_block", false)?;
        self.inner.load_block(block_id)
    }

    fn update_block(&self, block: &Block) -> Result<(), StorageError> {
        self.chaos("update_block", true)?;
        self.inner.update_block(block)
    }

    fn delete_block(&self, block_id: BlockId) -> Result<(), StorageError> {
        self.chaos("delete_block", true)?;
        self.inner.delete_block(block_id)
    }

    fn blocks_for_link(&self, link_id: LinkId) -> Result<Vec<Block>, StorageError> {
        self.chaos("blocks_for_link", false)?;
        self.inner.blocks_for_link(link_id)
    }

    fn list_blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.chaos("list_blocks", false)?;
        self.inner.list_blocks()
    }

    fn store_link(&self, link: &LinkRecord) -> Result<(), StorageError> {
        self.chaos("store_link", true)?;
        self.inner.store_link(link)
    }

    fn list_links(&self) -> Result<Vec<LinkRecord>, StorageError> {
        self.chaos("list_links", false)?;
        self.inner.list_links()
    }

    fn link_by_companion(&self, companion: KmeId) -> Result<Option<LinkRecord>, StorageError> {
        self.chaos("link_by_companion", false)?;
        self.inner.link_by_companion(companion)
    }

    fn store_key_rows(&self, rows: &[KeyRow]) -> Result<(), StorageError> {
        self.chaos("store_key_rows", true)?;
        self.inner.store_key_rows(rows)
    }

    fn take_key_row(&self, ksid: Ksid, key_id: KeyId) -> Result<Option<KeyRow>, StorageError> {
        self.chaos("take_key_row", true)?;
        self.inner.take_key_row(ksid, key_id)
    }

    fn take_session_rows(&self, ksid: Ksid) -> Result<Vec<KeyRow>, StorageError> {
        self.chaos("take_session_rows", true)?;
        self.inner.take_session_rows(ksid)
    }

    fn store_local_keys(&self, keys: &[LocalKey]) -> Result<(), StorageError> {
        self.chaos("store_local_keys", true)?;
        self.inner.store_local_keys(keys)
    }

    fn take_local_key(
        &self,
        ksid: Ksid,
        key_id: Option<KeyId>,
    ) -> Result<Option<LocalKey>, StorageError> {
        self.chaos("take_local_key", true)?;
        self.inner.take_local_key(ksid, key_id)
    }

    fn purge_local_keys(&self, ksid: Ksid) -> Result<usize, StorageError> {
        self.chaos("purge_local_keys", true)?;
        self.inner.purge_local_keys(ksid)
    }

    fn count_session_keys(&self, ksid: Ksid) -> Result<usize, StorageError> {
        self.chaos("count_session_keys", false)?;
        self.inner.count_session_keys(ksid)
    }

    fn store_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        self.chaos("store_session", true)?;
        self.inner.store_session(record)
    }

    fn delete_session(&self, ksid: Ksid) -> Result<(), StorageError> {
        self.chaos("delete_session", true)?;
        self.inner.delete_session(ksid)
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        self.chaos("list_sessions", false)?;
        self.inner.list_sessions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn block(id: u128) -> Block {
        Block::new(BlockId(id), LinkId(1), 0, id as u64, vec![0; 16])
    }

    #[test]
    fn zero_rate_never_fails() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        for i in 0..100 {
            chaotic.insert_block(&block(i)).unwrap();
        }

        assert_eq!(chaotic.blocks_for_link(LinkId(1)).unwrap().len(), 100);
        assert_eq!(chaotic.operation_count(), 101);
        assert_eq!(chaotic.failure_count(), 0);
    }

    #[test]
    fn full_rate_always_fails() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.0);

        assert!(chaotic.insert_block(&block(1)).is_err());
        assert!(chaotic.load_block(BlockId(1)).is_err());
        assert!(chaotic.take_session_rows(Ksid(1)).is_err());
        assert_eq!(chaotic.inner().block_count(), 0);
    }

    #[test]
    fn writes_only_lets_reads_through() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.0).writes_only();

        assert!(chaotic.insert_block(&block(1)).is_err());
        assert!(chaotic.list_blocks().unwrap().is_empty());
        assert_eq!(chaotic.failure_count(), 1);
    }

    #[test]
    fn scheduled_failure_hits_one_operation() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        chaotic.fail_on(2);

        assert!(chaotic.insert_block(&block(1)).is_ok());
        assert!(chaotic.insert_block(&block(2)).is_err());
        assert!(chaotic.insert_block(&block(3)).is_ok());
        assert_eq!(chaotic.inner().block_count(), 2);
    }

    #[test]
    fn same_seed_same_failures() {
        let a = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);
        let b = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);

        for i in 0..100 {
            assert_eq!(
                a.insert_block(&block(i)).is_ok(),
                b.insert_block(&block(i)).is_ok(),
                "determinism violated at iteration {i}"
            );
        }
    }

    #[test]
    #[should_panic(expected = "failure_rate must be between 0.0 and 1.0")]
    fn rejects_invalid_failure_rate() {
        let _chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.5);
    }
}
