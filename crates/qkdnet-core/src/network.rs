//! Seam between the service state machines and a transport.
//!
//! KME and controller nodes issue every outbound call through
//! [`PeerNetwork`]. Production plugs in the QUIC transport; the harness
//! plugs in an in-process router.

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    error::{Peer, QkdError},
    ids::KmeId,
    message::{ControllerRequest, ControllerResponse, KmeRequest, KmeResponse},
};

/// Transport-level failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No address is known for the peer.
    #[error("no address for {0}")]
    UnknownPeer(Peer),

    /// Connecting to the peer failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The stream broke mid-exchange.
    #[error("stream failed: {0}")]
    Stream(String),

    /// The peer sent something undecodable.
    #[error("codec failure: {0}")]
    Codec(String),
}

impl TransportError {
    /// Converts into the taxonomy error for a call to `peer`.
    pub fn unreachable(self, peer: Peer) -> QkdError {
        QkdError::PeerUnreachable { peer, reason: self.to_string() }
    }
}

/// Outbound calls from a node.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Sends a request to another KME and waits for its reply.
    async fn call_kme(&self, kme: KmeId, request: KmeRequest)
    -> Result<KmeResponse, TransportError>;

    /// Sends a request to the controller and waits for its reply.
    async fn call_controller(
        &self,
        request: ControllerRequest,
    ) -> Result<ControllerResponse, TransportError>;

    /// Records where a KME can be reached. Transports that route by id
    /// ignore this.
    fn learn_address(&self, _kme: KmeId, _address: &str) {}
}
