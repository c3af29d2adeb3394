//! Deterministic simulation harness for the QKD network emulator.
//!
//! Runs a controller and any number of KMEs in one process over a
//! simulated network. Time is virtual and randomness comes from one seed,
//! so a scenario replays identically.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties of the whole network between
//! requests: reservations match open sessions, every hop agrees on a
//! session's path, and relay hops keep nothing once a key has passed.
//! Use [`InvariantRegistry::standard()`] for all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod invariants;
pub mod quantum;
pub mod sim_env;
pub mod sim_network;

pub use cluster::{BLOCK_SIZE, SimCluster, SimKme};
pub use invariants::{
    EdgeSnapshot, Invariant, InvariantRegistry, InvariantResult, KmeSession, KmeSnapshot,
    NetworkSnapshot, NoOrphanSessions, PathsAgree, RelayHopsHoldNoKeys, ReservationsBalanced,
    Violation,
};
pub use quantum::QuantumChannel;
pub use sim_env::{SIM_EPOCH_SECS, SimEnv};
pub use sim_network::{ControllerHandler, Exchange, KmeHandler, SimNetwork};
