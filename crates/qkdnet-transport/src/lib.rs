//! QUIC transport for KMEs and the controller.
//!
//! Thin production glue around the Sans-IO nodes: [`QuicServer`] decodes
//! requests and hands them to a [`RequestHandler`], [`QuicNetwork`] carries
//! a node's outbound calls, and [`SystemEnv`] supplies real time and OS
//! randomness. Protocol logic lives in the service crates.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod error;
mod server;
mod system_env;

pub use client::QuicNetwork;
pub use error::ServerError;
pub use server::{ALPN_PROTOCOL, MAX_MESSAGE_SIZE, QuicServer, RequestHandler};
pub use system_env::SystemEnv;
