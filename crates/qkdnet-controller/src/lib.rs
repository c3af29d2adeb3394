//! SDN controller for the QKD network emulator.
//!
//! The controller sees the whole network: which KMEs exist, which quantum
//! links join them and how fast each link generates shared randomness. It
//! matches application registrations into sessions, routes each session
//! over a shortest path and reserves rate on every edge of that path.
//!
//! # Components
//!
//! - [`CapacityGraph`]: KME adjacency with windowed capacity per edge,
//!   all-pairs shortest paths and all-or-nothing reservations
//! - [`ConnectionDirectory`]: pending registrations and open sessions
//! - [`ControllerDriver`]: Sans-IO state machine turning requests into
//!   actions
//! - [`ControllerNode`]: executes those actions over a
//!   [`qkdnet_core::PeerNetwork`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod directory;
mod driver;
mod graph;
mod node;

pub use directory::{AppRequest, ConnectionDirectory, Matched};
pub use driver::{ControllerAction, ControllerDriver, ControllerStep};
pub use graph::{CapacityGraph, Edge, Reservation};
pub use node::ControllerNode;
