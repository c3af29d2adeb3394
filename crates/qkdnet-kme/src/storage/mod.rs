//! Storage abstraction for a KME.
//!
//! Trait-based abstraction for persisting blocks, links, instruction rows,
//! locally held keys and session records. The trait is synchronous (no
//! async): every call happens while the driver holds its lock, so storage
//! never sees two mutations of the same pool interleave.
//!
//! Query shapes the engines rely on:
//!
//! - blocks of one link in arrival order
//! - instruction rows and local keys by session
//! - links by companion KME

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use qkdnet_core::{
    Block, BlockId, KeyId, KeyMaterial, KmeId, Ksid, LinkId, SessionRecord, message::KeyRow,
};
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// A quantum link as seen from one end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Link identifier, shared by both ends.
    pub link_id: LinkId,
    /// KME on the other end, once the controller has confirmed the link.
    pub companion: Option<KmeId>,
    /// Companion's network address, once confirmed.
    pub address: Option<String>,
    /// Current generation-rate estimate (bits/s).
    pub rate: f64,
    /// Block TTL on this link, seconds.
    pub ttl_secs: u64,
    /// First block arrival, seconds since the Unix epoch.
    pub created_at: u64,
}

/// Key material held in the clear for local retrieval: prefetched keys on
/// the first hop, relayed keys on the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalKey {
    /// Session the key belongs to.
    pub ksid: Ksid,
    /// Key identifier.
    pub key_id: KeyId,
    /// Key bytes.
    pub material: KeyMaterial,
    /// Storage time, seconds since the Unix epoch.
    pub created_at: u64,
}

/// Storage abstraction for KME state.
///
/// Must be Clone (engines share one handle), Send + Sync, and synchronous.
/// Implementations share internal state via Arc, so clones access the same
/// underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned. Acceptable for test/simulation code.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Insert a block.
    ///
    /// Idempotent: returns `false` and changes nothing if a block with the
    /// same id already exists.
    fn insert_block(&self, block: &Block) -> Result<bool, StorageError>;

    /// Load a block by id.
    fn load_block(&self, block_id: BlockId) -> Result<Option<Block>, StorageError>;

    /// Overwrite a block's consumption state.
    ///
    /// # Invariants
    ///
    /// - Pre: the block exists (otherwise `StorageError::NotFound`)
    /// - The link, timestamp and arrival number never change
    fn update_block(&self, block: &Block) -> Result<(), StorageError>;

    /// Delete a block. No-op if absent.
    fn delete_block(&self, block_id: BlockId) -> Result<(), StorageError>;

    /// Blocks of one link, oldest first (by timestamp, then arrival).
    fn blocks_for_link(&self, link_id: LinkId) -> Result<Vec<Block>, StorageError>;

    /// Every block, in no particular order.
    fn list_blocks(&self) -> Result<Vec<Block>, StorageError>;

    /// Insert or overwrite a link record.
    fn store_link(&self, link: &LinkRecord) -> Result<(), StorageError>;

    /// Every link record.
    fn list_links(&self) -> Result<Vec<LinkRecord>, StorageError>;

    /// The link whose other end is `companion`.
    fn link_by_companion(&self, companion: KmeId) -> Result<Option<LinkRecord>, StorageError>;

    /// Persist instruction rows. All rows are written or none are.
    fn store_key_rows(&self, rows: &[KeyRow]) -> Result<(), StorageError>;

    /// Remove and return one instruction row.
    fn take_key_row(&self, ksid: Ksid, key_id: KeyId) -> Result<Option<KeyRow>, StorageError>;

    /// Remove and return every instruction row of a session.
    fn take_session_rows(&self, ksid: Ksid) -> Result<Vec<KeyRow>, StorageError>;

    /// Persist local keys. All keys are written or none are.
    fn store_local_keys(&self, keys: &[LocalKey]) -> Result<(), StorageError>;

    /// Remove and return a local key of a session: the given one, or the
    /// lowest key id if `key_id` is `None`.
    fn take_local_key(
        &self,
        ksid: Ksid,
        key_id: Option<KeyId>,
    ) -> Result<Option<LocalKey>, StorageError>;

    /// Delete every local key of a session. Returns how many were removed.
    fn purge_local_keys(&self, ksid: Ksid) -> Result<usize, StorageError>;

    /// Instruction rows plus local keys held for a session.
    fn count_session_keys(&self, ksid: Ksid) -> Result<usize, StorageError>;

    /// Insert or overwrite a session record.
    fn store_session(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Delete a session record. No-op if absent.
    fn delete_session(&self, ksid: Ksid) -> Result<(), StorageError>;

    /// Every session record.
    ///
    /// Used to rebuild the session index on startup.
    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError>;
}
