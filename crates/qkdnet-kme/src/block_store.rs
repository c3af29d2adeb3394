//! Block pool: ingest, allocation, replay and eviction.
//!
//! Blocks on a link are consumed oldest first. An allocation walks the
//! link's eligible blocks, carving from each until the request is covered,
//! and either succeeds completely or leaves every block untouched.
//!
//! # Invariants
//!
//! - A block's cursor only moves forward, except when an allocation rolls
//!   back its own carves before anyone else has carved after them.
//! - Two allocations on the same link never receive overlapping ranges.
//! - A block with `in_use > 0` is never evicted.
//!
//! Every method assumes the caller holds the KME lock; the store itself
//! does no locking.

use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use qkdnet_core::{Block, BlockId, Instruction, KeyMaterial, LinkId, QkdError};

use crate::storage::Storage;

/// Block pool of one KME, across all of its links.
pub struct BlockStore<S: Storage> {
    storage: S,
    ttl_secs: u64,
    next_arrival: u64,
}

impl<S: Storage> BlockStore<S> {
    /// Opens the pool over `storage`, resuming the arrival counter from any
    /// blocks already persisted.
    ///
    /// # Errors
    ///
    /// `Storage` if the existing blocks cannot be listed.
    pub fn open(storage: S, ttl: Duration) -> Result<Self, QkdError> {
        let next_arrival =
            storage.list_blocks()?.iter().map(|b| b.arrival + 1).max().unwrap_or(0);

        Ok(Self { storage, ttl_secs: ttl.as_secs().max(1), next_arrival })
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Block lifetime in seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Adds a freshly delivered block. Returns false if a block with the
    /// same id is already resident.
    ///
    /// # Errors
    ///
    /// `Storage` if the insert fails.
    pub fn ingest(
        &mut self,
        link_id: LinkId,
        block_id: BlockId,
        bytes: Vec<u8>,
        timestamp: u64,
    ) -> Result<bool, QkdError> {
        let block = Block::new(block_id, link_id, timestamp, self.next_arrival, bytes);
        let inserted = self.storage.insert_block(&block)?;
        if inserted {
            self.next_arrival += 1;
            tracing::debug!(%link_id, %block_id, bytes = block.bytes.len(), "block ingested");
        }
        Ok(inserted)
    }

    /// Bytes that a new allocation on `link_id` could use right now.
    ///
    /// # Errors
    ///
    /// `Storage` if the link's blocks cannot be read.
    pub fn available(&self, link_id: LinkId, now_secs: u64) -> Result<usize, QkdError> {
        Ok(self
            .storage
            .blocks_for_link(link_id)?
            .iter()
            .filter(|b| b.is_eligible(now_secs, self.ttl_secs))
            .map(Block::available)
            .sum())
    }

    /// Carves `n_bytes` from the oldest eligible blocks on `link_id`.
    ///
    /// Each returned instruction holds one reference on its block. The
    /// instructions are in consumption order; concatenating their slices
    /// yields the key material.
    ///
    /// # Errors
    ///
    /// - `BlockNotFound` if the link cannot cover `n_bytes`; nothing is
    ///   consumed.
    /// - `InvalidRequest` for a zero-length request.
    /// - `Storage` if writing a block fails; carves already written are
    ///   rolled back.
    pub fn reserve_range(
        &self,
        link_id: LinkId,
        n_bytes: usize,
        now_secs: u64,
    ) -> Result<Vec<Instruction>, QkdError> {
        if n_bytes == 0 {
            return Err(QkdError::InvalidRequest("zero-length allocation".to_string()));
        }

        let eligible: Vec<Block> = self
            .storage
            .blocks_for_link(link_id)?
            .into_iter()
            .filter(|b| b.is_eligible(now_secs, self.ttl_secs))
            .collect();

        let available: usize = eligible.iter().map(Block::available).sum();
        if available < n_bytes {
            return Err(QkdError::BlockNotFound { link_id, requested: n_bytes, available });
        }

        let mut carved = Vec::new();
        let mut remaining = n_bytes;
        for mut block in eligible {
            if remaining == 0 {
                break;
            }
            let Some(instruction) = block.carve(remaining) else {
                continue;
            };

            if let Err(err) = self.storage.update_block(&block) {
                self.rollback(&carved, true);
                return Err(err.into());
            }
            remaining -= instruction.len();
            carved.push(instruction);
        }

        debug_assert_eq!(remaining, 0);
        Ok(carved)
    }

    /// Reverts carves made by [`Self::reserve_range`], newest first.
    /// `release_ref` drops the references they still hold.
    ///
    /// # Errors
    ///
    /// `Storage` if a block cannot be read or written.
    pub fn undo(&self, carved: &[Instruction], release_ref: bool) -> Result<(), QkdError> {
        for instruction in carved.iter().rev() {
            let Some(mut block) = self.storage.load_block(instruction.block_id)? else {
                continue;
            };
            if !block.uncarve(instruction, release_ref) {
                // Someone carved after us; the range stays consumed.
                if release_ref {
                    block.release();
                }
            }
            self.storage.update_block(&block)?;
        }
        Ok(())
    }

    /// Replays instructions into key material.
    ///
    /// # Errors
    ///
    /// - `BlockEvicted` if a referenced block is gone.
    /// - `ProtocolViolation` if a range is empty or outside its block.
    pub fn read(&self, instructions: &[Instruction]) -> Result<KeyMaterial, QkdError> {
        let mut cache: BTreeMap<BlockId, Block> = BTreeMap::new();
        for instruction in instructions {
            if !cache.contains_key(&instruction.block_id) {
                let block = self
                    .storage
                    .load_block(instruction.block_id)?
                    .ok_or(QkdError::BlockEvicted { block_id: instruction.block_id })?;
                cache.insert(block.id, block);
            }
        }

        let mut parts = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            let block = cache
                .get(&instruction.block_id)
                .ok_or(QkdError::BlockEvicted { block_id: instruction.block_id })?;
            parts.push(block.slice(instruction)?);
        }
        Ok(KeyMaterial::concat(parts))
    }

    /// Drops one reference per instruction. Blocks already gone are
    /// skipped.
    ///
    /// # Errors
    ///
    /// `Storage` if a block cannot be read or written.
    pub fn release_range(&self, instructions: &[Instruction]) -> Result<(), QkdError> {
        for instruction in instructions {
            match self.storage.load_block(instruction.block_id)? {
                Some(mut block) => {
                    block.release();
                    self.storage.update_block(&block)?;
                },
                None => {
                    tracing::warn!(block_id = %instruction.block_id, "release on evicted block");
                },
            }
        }
        Ok(())
    }

    /// Mirrors ranges carved by the companion KME on `link_id`.
    ///
    /// Every consumed range advances its block's cursor. Ranges in
    /// `retained` also take a reference, since this KME will replay them.
    /// All blocks are checked before any is written.
    ///
    /// # Errors
    ///
    /// - `BlockEvicted` if a retained range points at a block that is not
    ///   resident here.
    /// - `ProtocolViolation` if a range is malformed or belongs to another
    ///   link.
    /// - `Storage` on backend failure.
    pub fn acknowledge(
        &self,
        link_id: LinkId,
        consumed: &[Instruction],
        retained: &HashSet<Instruction>,
    ) -> Result<(), QkdError> {
        let mut touched: BTreeMap<BlockId, Block> = BTreeMap::new();
        for instruction in consumed {
            instruction.validate()?;
            if touched.contains_key(&instruction.block_id) {
                continue;
            }

            match self.storage.load_block(instruction.block_id)? {
                Some(block) if block.link_id != link_id => {
                    return Err(QkdError::ProtocolViolation(format!(
                        "block {} is on link {}, not {link_id}",
                        block.id, block.link_id
                    )));
                },
                Some(block) => {
                    touched.insert(block.id, block);
                },
                None if retained.contains(instruction) => {
                    return Err(QkdError::BlockEvicted { block_id: instruction.block_id });
                },
                None => {
                    tracing::debug!(block_id = %instruction.block_id, "ack for unknown block");
                },
            }
        }

        for instruction in consumed {
            if let Some(block) = touched.get_mut(&instruction.block_id) {
                block.acknowledge(instruction, retained.contains(instruction));
            }
        }
        for block in touched.values() {
            self.storage.update_block(block)?;
        }
        Ok(())
    }

    /// Evicts every unreferenced block that is exhausted or expired.
    /// Returns the number evicted.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn sweep(&self, now_secs: u64) -> Result<usize, QkdError> {
        let mut evicted = 0;
        for block in self.storage.list_blocks()? {
            if block.is_evictable(now_secs, self.ttl_secs) {
                self.storage.delete_block(block.id)?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "swept blocks");
        }
        Ok(evicted)
    }

    /// Best-effort undo after a failed write. The original error is what
    /// the caller reports.
    fn rollback(&self, carved: &[Instruction], release_ref: bool) {
        if let Err(err) = self.undo(carved, release_ref) {
            tracing::error!(error = %err, carves = carved.len(), "rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChaoticStorage, MemoryStorage};

    const LINK: LinkId = LinkId(1);

    fn store() -> BlockStore<MemoryStorage> {
        BlockStore::open(MemoryStorage::new(), Duration::from_secs(15)).unwrap()
    }

    fn feed(store: &mut BlockStore<impl Storage>, id: u128, len: usize, ts: u64) {
        let bytes = (0..len).map(|i| (id as usize * 31 + i) as u8).collect();
        store.ingest(LINK, BlockId(id), bytes, ts).unwrap();
    }

    #[test]
    fn duplicate_ingest_is_noop() {
        let mut store = store();
        feed(&mut store, 1, 32, 0);
        assert!(!store.ingest(LINK, BlockId(1), vec![0; 8], 0).unwrap());
        assert_eq!(store.available(LINK, 0).unwrap(), 32);
    }

    #[test]
    fn allocation_spans_blocks_oldest_first() {
        let mut store = store();
        feed(&mut store, 2, 8, 5);
        feed(&mut store, 1, 8, 0);

        let carved = store.reserve_range(LINK, 12, 6).unwrap();

        assert_eq!(carved.len(), 2);
        assert_eq!(carved[0], Instruction { block_id: BlockId(1), start: 0, end: 8 });
        assert_eq!(carved[1], Instruction { block_id: BlockId(2), start: 0, end: 4 });
        assert_eq!(store.available(LINK, 6).unwrap(), 4);
    }

    #[test]
    fn shortage_consumes_nothing() {
        let mut store = store();
        feed(&mut store, 1, 8, 0);

        let err = store.reserve_range(LINK, 16, 0).unwrap_err();
        assert!(matches!(err, QkdError::BlockNotFound { requested: 16, available: 8, .. }));
        assert_eq!(store.available(LINK, 0).unwrap(), 8);
    }

    #[test]
    fn expired_blocks_are_not_allocated() {
        let mut store = store();
        feed(&mut store, 1, 8, 0);
        feed(&mut store, 2, 8, 10);

        let carved = store.reserve_range(LINK, 8, 20).unwrap();
        assert_eq!(carved[0].block_id, BlockId(2));
    }

    #[test]
    fn read_replays_bytes() {
        let mut store = store();
        feed(&mut store, 1, 16, 0);

        let expected: Vec<u8> = (4..12).map(|i| (31 + i) as u8).collect();
        let _ = store.reserve_range(LINK, 4, 0).unwrap();
        let carved = store.reserve_range(LINK, 8, 0).unwrap();
        assert_eq!(store.read(&carved).unwrap().as_bytes(), expected.as_slice());
    }

    #[test]
    fn read_after_eviction_fails() {
        let mut store = store();
        feed(&mut store, 1, 8, 0);
        let carved = store.reserve_range(LINK, 8, 0).unwrap();
        store.release_range(&carved).unwrap();
        assert_eq!(store.sweep(0).unwrap(), 1);

        assert!(matches!(store.read(&carved), Err(QkdError::BlockEvicted { .. })));
    }

    #[test]
    fn sweep_keeps_referenced_blocks() {
        let mut store = store();
        feed(&mut store, 1, 8, 0);
        let carved = store.reserve_range(LINK, 8, 0).unwrap();

        assert_eq!(store.sweep(100).unwrap(), 0);
        store.release_range(&carved).unwrap();
        assert_eq!(store.sweep(100).unwrap(), 1);
        assert_eq!(store.storage().block_count(), 0);
    }

    #[test]
    fn undo_restores_cursor_and_refs() {
        let mut store = store();
        feed(&mut store, 1, 8, 0);
        feed(&mut store, 2, 8, 0);
        let carved = store.reserve_range(LINK, 12, 0).unwrap();

        store.undo(&carved, true).unwrap();

        assert_eq!(store.available(LINK, 0).unwrap(), 16);
        for block in store.storage().list_blocks().unwrap() {
            assert_eq!((block.offset, block.in_use), (0, 0));
        }
    }

    #[test]
    fn acknowledge_advances_cursor_and_retains() {
        let mut store = store();
        feed(&mut store, 1, 32, 0);
        let retained = Instruction { block_id: BlockId(1), start: 8, end: 16 };
        let consumed = [Instruction { block_id: BlockId(1), start: 0, end: 8 }, retained];

        store.acknowledge(LINK, &consumed, &HashSet::from([retained])).unwrap();

        let block = store.storage().load_block(BlockId(1)).unwrap().unwrap();
        assert_eq!((block.offset, block.in_use), (16, 1));
    }

    #[test]
    fn acknowledge_rejects_foreign_link() {
        let mut store = store();
        store.ingest(LinkId(2), BlockId(1), vec![0; 8], 0).unwrap();
        let consumed = [Instruction { block_id: BlockId(1), start: 0, end: 8 }];

        let result = store.acknowledge(LINK, &consumed, &HashSet::new());
        assert!(matches!(result, Err(QkdError::ProtocolViolation(_))));
    }

    #[test]
    fn failed_write_rolls_back_earlier_carves() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        let mut store = BlockStore::open(chaotic.clone(), Duration::from_secs(15)).unwrap();
        for id in 1..=3 {
            feed(&mut store, id, 4, 0);
        }

        // blocks_for_link, update(1), update(2) <- fails
        chaotic.fail_on(chaotic.operation_count() + 3);
        assert!(matches!(store.reserve_range(LINK, 12, 0), Err(QkdError::Storage(_))));

        // ORACLE: a failed allocation leaves every block untouched
        for block in chaotic.inner().list_blocks().unwrap() {
            assert_eq!((block.offset, block.in_use), (0, 0));
        }
        assert_eq!(store.reserve_range(LINK, 12, 0).unwrap().len(), 3);
    }
}
