#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use qkdnet_core::{Block, BlockId, KeyId, KmeId, Ksid, LinkId, SessionRecord, message::KeyRow};

use super::{LinkRecord, LocalKey, Storage, StorageError};

/// In-memory storage implementation for testing and simulation
///
/// Blocks are indexed twice: by id for point lookups, and by
/// (link, timestamp, arrival) so a link's pool is read oldest first without
/// sorting. Rows and local keys live in `BTreeMap`s keyed by
/// (session, key) so per-session scans are range queries. All state is
/// wrapped in Arc<Mutex<>> to allow Clone and concurrent access; `lock()`
/// panics if the mutex is poisoned, which is acceptable for test code.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    blocks: HashMap<BlockId, Block>,
    /// (link, timestamp, arrival) -> block
    link_blocks: BTreeMap<(LinkId, u64, u64), BlockId>,
    links: HashMap<LinkId, LinkRecord>,
    key_rows: BTreeMap<(Ksid, KeyId), KeyRow>,
    local_keys: BTreeMap<(Ksid, KeyId), LocalKey>,
    sessions: HashMap<Ksid, SessionRecord>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())) }
    }

    /// Number of resident blocks.
    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Number of local keys across all sessions.
    pub fn local_key_count(&self) -> usize {
        self.lock().local_keys.len()
    }

    /// Number of instruction rows across all sessions.
    pub fn key_row_count(&self) -> usize {
        self.lock().key_rows.len()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().expect("Mutex poisoned")
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn session_range(ksid: Ksid) -> std::ops::RangeInclusive<(Ksid, KeyId)> {
    (ksid, KeyId(0))..=(ksid, KeyId(u128::MAX))
}

impl Storage for MemoryStorage {
    fn insert_block(&self, block: &Block) -> Result<bool, StorageError> {
        let mut inner = self.lock();
        if inner.blocks.contains_key(&block.id) {
            return Ok(false);
        }

        inner.link_blocks.insert((block.link_id, block.timestamp, block.arrival), block.id);
        inner.blocks.insert(block.id, block.clone());
        Ok(true)
    }

    fn load_block(&self, block_id: BlockId) -> Result<Option<Block>, StorageError> {
        Ok(self.lock().blocks.get(&block_id).cloned())
    }

    fn update_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let stored = inner
            .blocks
            .get_mut(&block.id)
            .ok_or_else(|| StorageError::NotFound { entity: "block", id: block.id.to_string() })?;

        if stored.link_id != block.link_id {
            return Err(StorageError::Conflict(format!(
                "block {} belongs to link {}",
                block.id, stored.link_id
            )));
        }

        stored.offset = block.offset;
        stored.in_use = block.in_use;
        Ok(())
    }

    fn delete_block(&self, block_id: BlockId) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if let Some(block) = inner.blocks.remove(&block_id) {
            inner.link_blocks.remove(&(block.link_id, block.timestamp, block.arrival));
        }
        Ok(())
    }

    fn blocks_for_link(&self, link_id: LinkId) -> Result<Vec<Block>, StorageError> {
        let inner = self.lock();
        let range = (link_id, 0, 0)..=(link_id, u64::MAX, u64::MAX);
        Ok(inner
            .link_blocks
            .range(range)
            .filter_map(|(_, id)| inner.blocks.get(id).cloned())
            .collect())
    }

    fn list_blocks(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self.lock().blocks.values().cloned().collect())
    }

    fn store_link(&self, link: &LinkRecord) -> Result<(), StorageError> {
        self.lock().links.insert(link.link_id, link.clone());
        Ok(())
    }

    fn list_links(&self) -> Result<Vec<LinkRecord>, StorageError> {
        Ok(self.lock().links.values().cloned().collect())
    }

    fn link_by_companion(&self, companion: KmeId) -> Result<Option<LinkRecord>, StorageError> {
        Ok(self.lock().links.values().find(|l| l.companion == Some(companion)).cloned())
    }

    fn store_key_rows(&self, rows: &[KeyRow]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        for row in rows {
            inner.key_rows.insert((row.ksid, row.key_id), row.clone());
        }
        Ok(())
    }

    fn take_key_row(&self, ksid: Ksid, key_id: KeyId) -> Result<Option<KeyRow>, StorageError> {
        Ok(self.lock().key_rows.remove(&(ksid, key_id)))
    }

    fn take_session_rows(&self, ksid: Ksid) -> Result<Vec<KeyRow>, StorageError> {
        let mut inner = self.lock();
        let keys: Vec<_> = inner.key_rows.range(session_range(ksid)).map(|(k, _)| *k).collect();
        Ok(keys.into_iter().filter_map(|k| inner.key_rows.remove(&k)).collect())
    }

    fn store_local_keys(&self, keys: &[LocalKey]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        for key in keys {
            inner.local_keys.insert((key.ksid, key.key_id), key.clone());
        }
        Ok(())
    }

    fn take_local_key(
        &self,
        ksid: Ksid,
        key_id: Option<KeyId>,
    ) -> Result<Option<LocalKey>, StorageError> {
        let mut inner = self.lock();
        let slot = match key_id {
            Some(key_id) => (ksid, key_id),
            None => match inner.local_keys.range(session_range(ksid)).next() {
                Some((slot, _)) => *slot,
                None => return Ok(None),
            },
        };
        Ok(inner.local_keys.remove(&slot))
    }

    fn purge_local_keys(&self, ksid: Ksid) -> Result<usize, StorageError> {
        let mut inner = self.lock();
        let keys: Vec<_> = inner.local_keys.range(session_range(ksid)).map(|(k, _)| *k).collect();
        for key in &keys {
            inner.local_keys.remove(key);
        }
        Ok(keys.len())
    }

    fn count_session_keys(&self, ksid: Ksid) -> Result<usize, StorageError> {
        let inner = self.lock();
        Ok(inner.key_rows.range(session_range(ksid)).count()
            + inner.local_keys.range(session_range(ksid)).count())
    }

    fn store_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        self.lock().sessions.insert(record.ksid, record.clone());
        Ok(())
    }

    fn delete_session(&self, ksid: Ksid) -> Result<(), StorageError> {
        self.lock().sessions.remove(&ksid);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        Ok(self.lock().sessions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use qkdnet_core::{Instruction, KeyMaterial, Qos};

    use super::*;

    fn block(id: u128, link: u128, timestamp: u64, arrival: u64) -> Block {
        Block::new(BlockId(id), LinkId(link), timestamp, arrival, vec![0xab; 32])
    }

    #[test]
    fn insert_block_is_idempotent() {
        let storage = MemoryStorage::new();
        assert!(storage.insert_block(&block(1, 1, 10, 0)).unwrap());

        let mut duplicate = block(1, 1, 10, 5);
        duplicate.offset = 7;
        assert!(!storage.insert_block(&duplicate).unwrap());
        assert_eq!(storage.load_block(BlockId(1)).unwrap().unwrap().offset, 0);
        assert_eq!(storage.block_count(), 1);
    }

    #[test]
    fn blocks_for_link_oldest_first() {
        let storage = MemoryStorage::new();
        storage.insert_block(&block(3, 1, 20, 2)).unwrap();
        storage.insert_block(&block(1, 1, 10, 1)).unwrap();
        storage.insert_block(&block(2, 1, 10, 0)).unwrap();
        storage.insert_block(&block(9, 2, 0, 3)).unwrap();

        let ids: Vec<_> =
            storage.blocks_for_link(LinkId(1)).unwrap().into_iter().map(|b| b.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn update_missing_block_fails() {
        let storage = MemoryStorage::new();
        let result = storage.update_block(&block(1, 1, 0, 0));
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn delete_block_removes_from_link_index() {
        let storage = MemoryStorage::new();
        storage.insert_block(&block(1, 1, 10, 0)).unwrap();
        storage.delete_block(BlockId(1)).unwrap();

        assert!(storage.blocks_for_link(LinkId(1)).unwrap().is_empty());
        assert!(storage.load_block(BlockId(1)).unwrap().is_none());
    }

    #[test]
    fn rows_are_scoped_to_session() {
        let storage = MemoryStorage::new();
        let row = |ksid: u128, key: u128| KeyRow {
            key_id: KeyId(key),
            ksid: Ksid(ksid),
            link_id: LinkId(1),
            instructions: vec![Instruction { block_id: BlockId(1), start: 0, end: 8 }],
            relay: false,
            created_at: 0,
        };
        storage.store_key_rows(&[row(1, 1), row(1, 2), row(2, 3)]).unwrap();

        assert_eq!(storage.count_session_keys(Ksid(1)).unwrap(), 2);
        assert!(storage.take_key_row(Ksid(2), KeyId(1)).unwrap().is_none());
        assert!(storage.take_key_row(Ksid(1), KeyId(1)).unwrap().is_some());
        assert_eq!(storage.take_session_rows(Ksid(1)).unwrap().len(), 1);
        assert_eq!(storage.key_row_count(), 1);
    }

    #[test]
    fn local_keys_pop_lowest_id_first() {
        let storage = MemoryStorage::new();
        let key = |id: u128| LocalKey {
            ksid: Ksid(1),
            key_id: KeyId(id),
            material: KeyMaterial::new(vec![id as u8]),
            created_at: 0,
        };
        storage.store_local_keys(&[key(5), key(2), key(9)]).unwrap();

        assert_eq!(storage.take_local_key(Ksid(1), None).unwrap().unwrap().key_id, KeyId(2));
        let named = storage.take_local_key(Ksid(1), Some(KeyId(9))).unwrap().unwrap();
        assert_eq!(named.key_id, KeyId(9));
        assert!(storage.take_local_key(Ksid(2), None).unwrap().is_none());
        assert_eq!(storage.purge_local_keys(Ksid(1)).unwrap(), 1);
        assert_eq!(storage.local_key_count(), 0);
    }

    #[test]
    fn link_lookup_by_companion() {
        let storage = MemoryStorage::new();
        storage
            .store_link(&LinkRecord {
                link_id: LinkId(1),
                companion: Some(KmeId(7)),
                address: None,
                rate: 0.0,
                ttl_secs: 15,
                created_at: 0,
            })
            .unwrap();

        assert_eq!(storage.link_by_companion(KmeId(7)).unwrap().unwrap().link_id, LinkId(1));
        assert!(storage.link_by_companion(KmeId(8)).unwrap().is_none());
    }

    #[test]
    fn sessions_roundtrip() {
        let storage = MemoryStorage::new();
        let record = SessionRecord {
            ksid: Ksid(1),
            src: qkdnet_core::AppId(1),
            dst: qkdnet_core::AppId(2),
            kme_src: KmeId(1),
            kme_dst: KmeId(2),
            qos: Qos { key_chunk_size: 256, request_interval_ms: 1000 },
            path: vec![KmeId(1), KmeId(2)],
            created_at: 0,
        };
        storage.store_session(&record).unwrap();
        assert_eq!(storage.list_sessions().unwrap(), vec![record]);

        storage.delete_session(Ksid(1)).unwrap();
        assert!(storage.list_sessions().unwrap().is_empty());
    }
}
