//! Error taxonomy shared by every service.
//!
//! Each layer rolls back only what it owns and re-raises; nothing here is
//! retried automatically. [`ErrorKind`] is the stable code that crosses the
//! wire, so a failure deep in a relay chain reaches the requesting
//! application with the same kind it was raised with.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AppId, BlockId, KeyId, KmeId, Ksid, LinkId};

/// Stable error code carried in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Not enough random-bit inventory, or a referenced block is gone.
    BlockNotFound,
    /// Unknown Ksid or endpoint pair.
    SessionNotFound,
    /// No route, or not enough capacity along the route.
    PathRejected,
    /// Transport failure towards an adjacent hop or the controller.
    PeerUnreachable,
    /// Malformed exchange between KMEs. Always a defect.
    ProtocolViolation,
    /// The caller asked for something the service will not do.
    InvalidRequest,
    /// The persistence backend failed.
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BlockNotFound => "block_not_found",
            Self::SessionNotFound => "session_not_found",
            Self::PathRejected => "path_rejected",
            Self::PeerUnreachable => "peer_unreachable",
            Self::ProtocolViolation => "protocol_violation",
            Self::InvalidRequest => "invalid_request",
            Self::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// Remote end of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Peer {
    /// Another KME.
    Kme(KmeId),
    /// The SDN controller.
    Controller,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kme(id) => write!(f, "kme {id}"),
            Self::Controller => f.write_str("controller"),
        }
    }
}

/// How a session was looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRef {
    /// By session identifier.
    Ksid(Ksid),
    /// By (source, destination) application pair.
    Apps {
        /// Source (master) application.
        src: AppId,
        /// Destination (slave) application.
        dst: AppId,
    },
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ksid(ksid) => write!(f, "ksid {ksid}"),
            Self::Apps { src, dst } => write!(f, "apps {src} -> {dst}"),
        }
    }
}

/// Why admission control refused a path.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The endpoints are not connected in the capacity graph.
    NoRoute,
    /// Fewer nodes or links than expected have registered, so no path
    /// table exists yet.
    TopologyIncomplete,
    /// One edge cannot carry the requested rate.
    Capacity {
        /// Edge start.
        from: KmeId,
        /// Edge end.
        to: KmeId,
        /// Rate asked of this edge, overhead included (bits/s).
        requested: f64,
        /// Capacity estimate minus what is already reserved (bits/s).
        headroom: f64,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute => f.write_str("no route"),
            Self::TopologyIncomplete => f.write_str("topology incomplete"),
            Self::Capacity { from, to, requested, headroom } => write!(
                f,
                "edge {from} - {to} has {headroom:.1} b/s headroom, {requested:.1} b/s requested"
            ),
        }
    }
}

/// Errors raised by the block store, key engine, relay engine, connection
/// directory and admission controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QkdError {
    /// The link's pool cannot supply the requested bytes.
    ///
    /// Fatal to the current key request. Any ranges carved for the request
    /// have already been rolled back when this surfaces.
    #[error(
        "insufficient inventory on link {link_id}: wanted {requested} bytes, {available} available"
    )]
    BlockNotFound {
        /// Link whose pool ran dry.
        link_id: LinkId,
        /// Bytes the key needed.
        requested: usize,
        /// Bytes that were eligible.
        available: usize,
    },

    /// An instruction references a block that was already evicted.
    ///
    /// This is an inconsistency between persisted instructions and the
    /// pool, not a shortage. Reported under [`ErrorKind::BlockNotFound`].
    #[error("block {block_id} is no longer resident")]
    BlockEvicted {
        /// The missing block.
        block_id: BlockId,
    },

    /// This KME has no link towards the given neighbour.
    #[error("no link to companion {companion}")]
    LinkNotFound {
        /// The neighbour that was expected on the other end.
        companion: KmeId,
    },

    /// Unknown session.
    #[error("unknown session ({0})")]
    SessionNotFound(SessionRef),

    /// Unknown key on a session that does exist.
    #[error("no key {key_id} on session {ksid}")]
    KeyNotFound {
        /// Session that was searched.
        ksid: Ksid,
        /// Key the caller asked for.
        key_id: KeyId,
    },

    /// Admission control refused the connection.
    #[error("path {src} -> {dst} rejected: {reason}")]
    PathRejected {
        /// Source KME.
        src: KmeId,
        /// Destination KME.
        dst: KmeId,
        /// Which check failed.
        reason: RejectReason,
    },

    /// A call to an adjacent hop or to the controller failed in transport.
    #[error("{peer} unreachable: {reason}")]
    PeerUnreachable {
        /// Who we tried to reach.
        peer: Peer,
        /// Transport error text.
        reason: String,
    },

    /// Malformed exchange: length mismatch in an XOR combine, an empty or
    /// out-of-range instruction, a relay message at the wrong hop.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The request itself is unacceptable (bad key size, too many keys).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The persistence backend failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A peer answered with an error reply.
    #[error("{kind} reported by peer: {message}")]
    Remote {
        /// Kind reported by the peer.
        kind: ErrorKind,
        /// Peer's error text.
        message: String,
    },
}

impl QkdError {
    /// Wire code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BlockNotFound { .. } | Self::BlockEvicted { .. } | Self::LinkNotFound { .. } => {
                ErrorKind::BlockNotFound
            },
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::KeyNotFound { .. } | Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::PathRejected { .. } => ErrorKind::PathRejected,
            Self::PeerUnreachable { .. } => ErrorKind::PeerUnreachable,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Returns true if this error signals a defect rather than a shortage or
    /// a caller mistake.
    ///
    /// Fatal errors are logged at error level and the request fails closed.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::BlockEvicted { .. } | Self::ProtocolViolation(_) => true,
            Self::Remote { kind, .. } => *kind == ErrorKind::ProtocolViolation,
            _ => false,
        }
    }

    /// Error reply to send back to a caller.
    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply { kind: self.kind(), message: self.to_string() }
    }
}

/// Serialized form of a [`QkdError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error code.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl From<ErrorReply> for QkdError {
    fn from(reply: ErrorReply) -> Self {
        Self::Remote { kind: reply.kind, message: reply.message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_maps_to_block_not_found_and_is_fatal() {
        let err = QkdError::BlockEvicted { block_id: BlockId(7) };
        assert_eq!(err.kind(), ErrorKind::BlockNotFound);
        assert!(err.is_fatal());

        let shortage = QkdError::BlockNotFound { link_id: LinkId(1), requested: 16, available: 0 };
        assert_eq!(shortage.kind(), ErrorKind::BlockNotFound);
        assert!(!shortage.is_fatal());
    }

    #[test]
    fn remote_errors_keep_their_kind() {
        let original = QkdError::PathRejected {
            src: KmeId(1),
            dst: KmeId(2),
            reason: RejectReason::NoRoute,
        };
        let relayed = QkdError::from(original.to_reply());

        assert_eq!(relayed.kind(), ErrorKind::PathRejected);
        assert!(relayed.to_string().contains("no route"));
    }
}
