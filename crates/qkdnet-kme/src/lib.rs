//! Key Management Entity.
//!
//! A KME holds a pool of shared random blocks for every quantum link it
//! terminates and brokers keys to the applications attached to it.
//!
//! # Components
//!
//! - [`BlockStore`]: per-link block pool with carve, acknowledge and sweep
//! - [`KeyEngine`]: carves keys from the pool and replays them from
//!   instruction rows synced by the companion KME
//! - [`RelayState`]: a KME's role on a session path and the XOR masking of
//!   relayed keys
//! - [`KmeDriver`]: Sans-IO state machine turning requests into actions
//! - [`KmeNode`]: executes those actions over a [`qkdnet_core::PeerNetwork`]
//! - [`storage`]: persistence behind the [`Storage`] trait

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod block_store;
mod driver;
mod key_engine;
mod node;
mod relay;
pub mod storage;

pub use block_store::BlockStore;
pub use driver::{KmeAction, KmeDriver, Reply, Step};
pub use key_engine::{GeneratedKey, Generation, KeyBatch, KeyEngine};
pub use node::{KmeNode, register};
pub use relay::{RelayState, unwrap as unwrap_relayed, wrap as wrap_relayed};
pub use storage::{
    ChaoticStorage, LinkRecord, LocalKey, MemoryStorage, RedbStorage, Storage, StorageError,
};
