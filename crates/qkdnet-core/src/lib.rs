//! Core types and pure logic for the QKD network emulator.
//!
//! Everything here is free of I/O: identifiers, the error taxonomy, the
//! configuration structs, key material and its transport encoding, block
//! allocation primitives, rate estimators, the session index and the wire
//! messages exchanged between KMEs and the controller. The service crates
//! (`qkdnet-kme`, `qkdnet-controller`) build their state machines on top of
//! these, and the [`network::PeerNetwork`] trait is the only seam where a
//! transport plugs in.
//!
//! # Time and randomness
//!
//! Protocol code never reads the clock or the OS RNG directly. It goes
//! through [`env::Environment`], so the simulation harness can run whole
//! networks deterministically from a seed.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod block;
pub mod config;
pub mod env;
pub mod error;
pub mod ids;
pub mod material;
pub mod message;
pub mod network;
pub mod rate;
pub mod session;

pub use block::{Block, Instruction};
pub use config::{ConfigError, ControllerConfig, KmeConfig, OverheadPolicy};
pub use env::Environment;
pub use error::{ErrorKind, ErrorReply, Peer, QkdError, RejectReason, SessionRef};
pub use ids::{AppId, BlockId, KeyId, KmeId, Ksid, LinkId};
pub use material::KeyMaterial;
pub use network::{PeerNetwork, TransportError};
pub use rate::{CapacityWindow, RateEstimator};
pub use session::{Qos, Registration, SessionIndex, SessionRecord};
