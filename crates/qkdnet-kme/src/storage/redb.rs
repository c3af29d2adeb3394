//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Blocks,
//! instruction rows and sessions survive a KME restart; every multi-record
//! write is a single transaction.

use std::{path::Path, sync::Arc};

use qkdnet_core::{Block, BlockId, KeyId, KmeId, Ksid, LinkId, SessionRecord, message::KeyRow};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{LinkRecord, LocalKey, Storage, StorageError};

/// Table: blocks
/// Key: block_id as big-endian bytes [16 bytes]
/// Value: CBOR-encoded Block
const BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blocks");

/// Table: link_blocks
/// Key: (link_id: u128, timestamp: u64, arrival: u64) as big-endian bytes [32 bytes]
/// Value: block_id [16 bytes]
const LINK_BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("link_blocks");

/// Table: links
/// Key: link_id as big-endian bytes [16 bytes]
/// Value: CBOR-encoded LinkRecord
const LINKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("links");

/// Table: key_rows
/// Key: (ksid: u128, key_id: u128) as big-endian bytes [32 bytes]
/// Value: CBOR-encoded KeyRow
const KEY_ROWS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("key_rows");

/// Table: local_keys
/// Key: (ksid: u128, key_id: u128) as big-endian bytes [32 bytes]
/// Value: CBOR-encoded LocalKey
const LOCAL_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("local_keys");

/// Table: sessions
/// Key: ksid as big-endian bytes [16 bytes]
/// Value: CBOR-encoded SessionRecord
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates all tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            for table in [BLOCKS, LINK_BLOCKS, LINKS, KEY_ROWS, LOCAL_KEYS, SESSIONS] {
                let _ = txn.open_table(table).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_all<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<&[u8], &[u8]>,
    ) -> Result<Vec<T>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(definition).map_err(io)?;

        let mut out = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            out.push(from_cbor(value.value())?);
        }
        Ok(out)
    }

    fn read_one<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(definition).map_err(io)?;

        match table.get(key).map_err(io)? {
            Some(value) => Ok(Some(from_cbor(value.value())?)),
            None => Ok(None),
        }
    }

    fn write_one<T: Serialize>(
        &self,
        definition: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = to_cbor(value)?;
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(definition).map_err(io)?;
            table.insert(key, bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)
    }

    /// Removes one session's entries from a (ksid, key_id)-keyed table.
    /// `first_only` stops after the lowest key id.
    fn take_session_entries<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<&[u8], &[u8]>,
        ksid: Ksid,
        first_only: bool,
    ) -> Result<Vec<T>, StorageError> {
        let start = session_key(ksid, KeyId(0));
        let end = session_key(ksid, KeyId(u128::MAX));

        let txn = self.db.begin_write().map_err(io)?;
        let mut taken = Vec::new();
        {
            let mut table = txn.open_table(definition).map_err(io)?;

            // Collect first; the table cannot be mutated while a range is open.
            let mut keys = Vec::new();
            for entry in table.range(start.as_slice()..=end.as_slice()).map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                keys.push(key.value().to_vec());
                taken.push(from_cbor(value.value())?);
                if first_only {
                    break;
                }
            }

            for key in &keys {
                table.remove(key.as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;

        Ok(taken)
    }
}

impl Storage for RedbStorage {
    fn insert_block(&self, block: &Block) -> Result<bool, StorageError> {
        let key = block.id.to_be_bytes();
        let bytes = to_cbor(block)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut blocks = txn.open_table(BLOCKS).map_err(io)?;
            if blocks.get(key.as_slice()).map_err(io)?.is_some() {
                return Ok(false);
            }
            blocks.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;

            let mut index = txn.open_table(LINK_BLOCKS).map_err(io)?;
            let index_key = link_block_key(block.link_id, block.timestamp, block.arrival);
            index.insert(index_key.as_slice(), key.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(true)
    }

    fn load_block(&self, block_id: BlockId) -> Result<Option<Block>, StorageError> {
        self.read_one(BLOCKS, &block_id.to_be_bytes())
    }

    fn update_block(&self, block: &Block) -> Result<(), StorageError> {
        let key = block.id.to_be_bytes();

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(BLOCKS).map_err(io)?;
            let existing = table.get(key.as_slice()).map_err(io)?.map(|v| v.value().to_vec());
            let Some(existing) = existing else {
                return Err(StorageError::NotFound { entity: "block", id: block.id.to_string() });
            };

            let mut stored: Block = from_cbor(&existing)?;
            if stored.link_id != block.link_id {
                return Err(StorageError::Conflict(format!(
                    "block {} belongs to link {}",
                    block.id, stored.link_id
                )));
            }
            stored.offset = block.offset;
            stored.in_use = block.in_use;

            let bytes = to_cbor(&stored)?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)
    }

    fn delete_block(&self, block_id: BlockId) -> Result<(), StorageError> {
        let key = block_id.to_be_bytes();

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut blocks = txn.open_table(BLOCKS).map_err(io)?;
            let removed = blocks.remove(key.as_slice()).map_err(io)?.map(|v| v.value().to_vec());

            if let Some(bytes) = removed {
                let block: Block = from_cbor(&bytes)?;
                let mut index = txn.open_table(LINK_BLOCKS).map_err(io)?;
                let index_key = link_block_key(block.link_id, block.timestamp, block.arrival);
                index.remove(index_key.as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)
    }

    fn blocks_for_link(&self, link_id: LinkId) -> Result<Vec<Block>, StorageError> {
        let start = link_block_key(link_id, 0, 0);
        let end = link_block_key(link_id, u64::MAX, u64::MAX);

        let txn = self.db.begin_read().map_err(io)?;
        let index = txn.open_table(LINK_BLOCKS).map_err(io)?;
        let blocks = txn.open_table(BLOCKS).map_err(io)?;

        let mut out = Vec::new();
        for entry in index.range(start.as_slice()..=end.as_slice()).map_err(io)? {
            let (_, block_id) = entry.map_err(io)?;
            if let Some(value) = blocks.get(block_id.value()).map_err(io)? {
                out.push(from_cbor(value.value())?);
            }
        }
        Ok(out)
    }

    fn list_blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.read_all(BLOCKS)
    }

    fn store_link(&self, link: &LinkRecord) -> Result<(), StorageError> {
        self.write_one(LINKS, &link.link_id.to_be_bytes(), link)
    }

    fn list_links(&self) -> Result<Vec<LinkRecord>, StorageError> {
        self.read_all(LINKS)
    }

    fn link_by_companion(&self, companion: KmeId) -> Result<Option<LinkRecord>, StorageError> {
        Ok(self
            .list_links()?
            .into_iter()
            .find(|link: &LinkRecord| link.companion == Some(companion)))
    }

    fn store_key_rows(&self, rows: &[KeyRow]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(KEY_ROWS).map_err(io)?;
            for row in rows {
                let bytes = to_cbor(row)?;
                let key = session_key(row.ksid, row.key_id);
                table.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)
    }

    fn take_key_row(&self, ksid: Ksid, key_id: KeyId) -> Result<Option<KeyRow>, StorageError> {
        let key = session_key(ksid, key_id);

        let txn = self.db.begin_write().map_err(io)?;
        let removed = {
            let mut table = txn.open_table(KEY_ROWS).map_err(io)?;
            table.remove(key.as_slice()).map_err(io)?.map(|v| v.value().to_vec())
        };
        txn.commit().map_err(io)?;

        removed.map(|bytes| from_cbor(&bytes)).transpose()
    }

    fn take_session_rows(&self, ksid: Ksid) -> Result<Vec<KeyRow>, StorageError> {
        self.take_session_entries(KEY_ROWS, ksid, false)
    }

    fn store_local_keys(&self, keys: &[LocalKey]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(LOCAL_KEYS).map_err(io)?;
            for local in keys {
                let bytes = to_cbor(local)?;
                let key = session_key(local.ksid, local.key_id);
                table.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)
    }

    fn take_local_key(
        &self,
        ksid: Ksid,
        key_id: Option<KeyId>,
    ) -> Result<Option<LocalKey>, StorageError> {
        let Some(key_id) = key_id else {
            return Ok(self.take_session_entries(LOCAL_KEYS, ksid, true)?.pop());
        };

        let key = session_key(ksid, key_id);
        let txn = self.db.begin_write().map_err(io)?;
        let removed = {
            let mut table = txn.open_table(LOCAL_KEYS).map_err(io)?;
            table.remove(key.as_slice()).map_err(io)?.map(|v| v.value().to_vec())
        };
        txn.commit().map_err(io)?;

        removed.map(|bytes| from_cbor(&bytes)).transpose()
    }

    fn purge_local_keys(&self, ksid: Ksid) -> Result<usize, StorageError> {
        Ok(self.take_session_entries::<LocalKey>(LOCAL_KEYS, ksid, false)?.len())
    }

    fn count_session_keys(&self, ksid: Ksid) -> Result<usize, StorageError> {
        let start = session_key(ksid, KeyId(0));
        let end = session_key(ksid, KeyId(u128::MAX));

        let txn = self.db.begin_read().map_err(io)?;
        let mut count = 0;
        for definition in [KEY_ROWS, LOCAL_KEYS] {
            let table = txn.open_table(definition).map_err(io)?;
            for entry in table.range(start.as_slice()..=end.as_slice()).map_err(io)? {
                entry.map_err(io)?;
                count += 1;
            }
        }
        Ok(count)
    }

    fn store_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        self.write_one(SESSIONS, &record.ksid.to_be_bytes(), record)
    }

    fn delete_session(&self, ksid: Ksid) -> Result<(), StorageError> {
        let key = ksid.to_be_bytes();
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(io)?;
            table.remove(key.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        self.read_all(SESSIONS)
    }
}

fn io(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Encode (link_id, timestamp, arrival) as 32-byte key.
fn link_block_key(link_id: LinkId, timestamp: u64, arrival: u64) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[0..16].copy_from_slice(&link_id.to_be_bytes());
    key[16..24].copy_from_slice(&timestamp.to_be_bytes());
    key[24..32].copy_from_slice(&arrival.to_be_bytes());
    key
}

/// Encode (ksid, key_id) as 32-byte key.
fn session_key(ksid: Ksid, key_id: KeyId) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[0..16].copy_from_slice(&ksid.to_be_bytes());
    key[16..32].copy_from_slice(&key_id.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use qkdnet_core::{AppId, Instruction, KeyMaterial, Qos};
    use tempfile::TempDir;

    use super::*;

    fn open() -> (RedbStorage, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("kme.redb")).unwrap();
        (storage, dir)
    }

    fn block(id: u128, link: u128, timestamp: u64, arrival: u64) -> Block {
        Block::new(BlockId(id), LinkId(link), timestamp, arrival, vec![7; 64])
    }

    #[test]
    fn blocks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kme.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            let mut b = block(1, 1, 10, 0);
            storage.insert_block(&b).unwrap();
            b.offset = 32;
            b.in_use = 1;
            storage.update_block(&b).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        let loaded = storage.load_block(BlockId(1)).unwrap().unwrap();
        assert_eq!(loaded.offset, 32);
        assert_eq!(loaded.in_use, 1);
        assert_eq!(loaded.bytes.len(), 64);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let (storage, _dir) = open();
        assert!(storage.insert_block(&block(1, 1, 10, 0)).unwrap());
        assert!(!storage.insert_block(&block(1, 1, 99, 9)).unwrap());
        assert_eq!(storage.blocks_for_link(LinkId(1)).unwrap().len(), 1);
    }

    #[test]
    fn blocks_for_link_in_arrival_order() {
        let (storage, _dir) = open();
        storage.insert_block(&block(3, 1, 20, 2)).unwrap();
        storage.insert_block(&block(2, 1, 10, 1)).unwrap();
        storage.insert_block(&block(1, 1, 10, 0)).unwrap();
        storage.insert_block(&block(4, 2, 0, 3)).unwrap();

        let ids: Vec<_> =
            storage.blocks_for_link(LinkId(1)).unwrap().into_iter().map(|b| b.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        storage.delete_block(BlockId(2)).unwrap();
        assert_eq!(storage.blocks_for_link(LinkId(1)).unwrap().len(), 2);
        assert_eq!(storage.list_blocks().unwrap().len(), 3);
    }

    #[test]
    fn update_missing_block_fails() {
        let (storage, _dir) = open();
        assert!(matches!(
            storage.update_block(&block(1, 1, 0, 0)),
            Err(StorageError::NotFound { entity: "block", .. })
        ));
    }

    #[test]
    fn rows_and_local_keys_by_session() {
        let (storage, _dir) = open();
        let rows: Vec<_> = (1..=3)
            .map(|k| KeyRow {
                key_id: KeyId(k),
                ksid: Ksid(9),
                link_id: LinkId(1),
                instructions: vec![Instruction { block_id: BlockId(1), start: 0, end: 4 }],
                relay: false,
                created_at: 0,
            })
            .collect();
        storage.store_key_rows(&rows).unwrap();
        storage
            .store_local_keys(&[LocalKey {
                ksid: Ksid(9),
                key_id: KeyId(50),
                material: KeyMaterial::new(vec![1, 2]),
                created_at: 0,
            }])
            .unwrap();

        assert_eq!(storage.count_session_keys(Ksid(9)).unwrap(), 4);
        assert_eq!(storage.take_key_row(Ksid(9), KeyId(2)).unwrap(), Some(rows[1].clone()));
        assert_eq!(storage.take_session_rows(Ksid(9)).unwrap().len(), 2);

        let local = storage.take_local_key(Ksid(9), None).unwrap().unwrap();
        assert_eq!(local.material.as_bytes(), &[1, 2]);
        assert_eq!(storage.count_session_keys(Ksid(9)).unwrap(), 0);
    }

    #[test]
    fn links_and_sessions() {
        let (storage, _dir) = open();
        let link = LinkRecord {
            link_id: LinkId(1),
            companion: Some(KmeId(2)),
            address: Some("127.0.0.1:4433".to_string()),
            rate: 800.0,
            ttl_secs: 15,
            created_at: 0,
        };
        storage.store_link(&link).unwrap();
        assert_eq!(storage.link_by_companion(KmeId(2)).unwrap(), Some(link));

        let record = SessionRecord {
            ksid: Ksid(3),
            src: AppId(1),
            dst: AppId(2),
            kme_src: KmeId(1),
            kme_dst: KmeId(2),
            qos: Qos { key_chunk_size: 128, request_interval_ms: 500 },
            path: vec![KmeId(1), KmeId(2)],
            created_at: 0,
        };
        storage.store_session(&record).unwrap();
        assert_eq!(storage.list_sessions().unwrap(), vec![record]);
        storage.delete_session(Ksid(3)).unwrap();
        assert!(storage.list_sessions().unwrap().is_empty());
    }
}
