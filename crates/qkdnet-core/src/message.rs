//! Request/response messages between applications, KMEs and the controller.
//!
//! Every exchange is one request answered by one response. Errors travel as
//! an [`ErrorReply`] variant so the error kind survives the hop. Messages
//! are CBOR-encoded on the wire; key material inside them is always base64
//! and, once more than one hop is involved, XOR-masked.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    block::Instruction,
    error::{ErrorReply, QkdError},
    ids::{AppId, BlockId, KeyId, KmeId, Ksid, LinkId},
    session::{Qos, Registration, SessionRecord},
};

/// Persisted allocation instructions for one key, waiting for the KME that
/// will reconstruct it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRow {
    /// Key identifier.
    pub key_id: KeyId,
    /// Session the key belongs to.
    pub ksid: Ksid,
    /// Link whose blocks back the key.
    pub link_id: LinkId,
    /// Ordered byte ranges making up the key.
    pub instructions: Vec<Instruction>,
    /// True for a one-time key that only wraps a relayed key.
    pub relay: bool,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
}

/// A key handed to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContainer {
    /// Key identifier.
    pub key_id: KeyId,
    /// Base64 key material.
    pub key: String,
}

/// Session status reported to applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Session identifier.
    pub ksid: Ksid,
    /// Master application.
    pub src: AppId,
    /// Slave application.
    pub dst: AppId,
    /// Default key size (bits).
    pub key_size: u32,
    /// Keys currently held for the session on this KME.
    pub stored_key_count: usize,
    /// Keys a session may hold.
    pub max_key_count: usize,
    /// Keys per request.
    pub max_key_per_request: u32,
    /// Largest key size (bits).
    pub max_key_size: u32,
    /// Smallest key size (bits).
    pub min_key_size: u32,
    /// Additional slave applications per key.
    pub max_sae_id_count: u32,
}

/// Requests served by a KME.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KmeRequest {
    /// Quantum-channel feed: a new block of shared randomness.
    DeliverBlock {
        /// Link the block arrived on.
        link_id: LinkId,
        /// Block identifier, identical at both ends.
        block_id: BlockId,
        /// Arrival time, seconds since the Unix epoch.
        timestamp: u64,
        /// Shared random bytes.
        bytes: Vec<u8>,
    },
    /// Application: register one side of a connection.
    OpenSession {
        /// Master application.
        src: AppId,
        /// Slave application.
        dst: AppId,
        /// Requested QoS.
        qos: Qos,
        /// True if the caller is the master side.
        master: bool,
    },
    /// Master application: fetch new keys.
    EncKeys {
        /// Master application.
        src: AppId,
        /// Slave application.
        dst: AppId,
        /// Number of keys.
        number: u32,
        /// Key size in bits, configured default if absent.
        size: Option<u32>,
    },
    /// Slave application: fetch keys by id.
    DecKeys {
        /// Master application.
        src: AppId,
        /// Slave application.
        dst: AppId,
        /// Keys announced by the master.
        key_ids: Vec<KeyId>,
    },
    /// Application: session status.
    Status {
        /// Master application.
        src: AppId,
        /// Slave application.
        dst: AppId,
    },
    /// Application or neighbouring KME: close a session.
    CloseSession {
        /// Session to close.
        ksid: Ksid,
        /// KME that forwarded the close, if any. Not forwarded back.
        from: Option<KmeId>,
    },
    /// Companion KME: instruction rows to persist and ranges it consumed.
    SyncKeys {
        /// Shared link.
        link_id: LinkId,
        /// Rows this KME will reconstruct later.
        rows: Vec<KeyRow>,
        /// Every range the companion carved, rows included.
        consumed: Vec<Instruction>,
    },
    /// Previous hop: a relayed key masked with a one-time key.
    RelayForward {
        /// Session being served.
        ksid: Ksid,
        /// Identifier of the relayed key.
        key_id: KeyId,
        /// One-time key whose instructions were synced beforehand.
        otk_id: KeyId,
        /// Base64 of `key ^ one_time_key`.
        cipher: String,
        /// Key size in bits.
        size: u32,
    },
    /// Controller: this KME is on a new session's path.
    AssignSession {
        /// The session.
        record: SessionRecord,
    },
    /// Controller: both ends of a link have registered.
    LinkConfirmed {
        /// The link.
        link_id: LinkId,
        /// KME on the other end.
        companion: KmeId,
        /// Its network address.
        address: String,
    },
}

impl KmeRequest {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeliverBlock { .. } => "deliver_block",
            Self::OpenSession { .. } => "open_session",
            Self::EncKeys { .. } => "enc_keys",
            Self::DecKeys { .. } => "dec_keys",
            Self::Status { .. } => "status",
            Self::CloseSession { .. } => "close_session",
            Self::SyncKeys { .. } => "sync_keys",
            Self::RelayForward { .. } => "relay_forward",
            Self::AssignSession { .. } => "assign_session",
            Self::LinkConfirmed { .. } => "link_confirmed",
        }
    }
}

/// KME replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KmeResponse {
    /// Done, nothing to return.
    Ack,
    /// Registration outcome.
    Session(Registration),
    /// Keys for an application.
    Keys(Vec<KeyContainer>),
    /// Session status.
    Status(StatusReport),
    /// The request failed.
    Error(ErrorReply),
}

impl KmeResponse {
    /// Lifts an error reply into `Err`.
    ///
    /// # Errors
    ///
    /// [`QkdError::Remote`] carrying the reply's kind.
    pub fn into_result(self) -> Result<Self, QkdError> {
        match self {
            Self::Error(reply) => Err(reply.into()),
            other => Ok(other),
        }
    }
}

/// Requests served by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerRequest {
    /// A KME joins the network.
    RegisterKme {
        /// Address the KME serves on.
        address: String,
    },
    /// One end of a link saw its first block.
    NewLink {
        /// The link.
        link_id: LinkId,
        /// Reporting KME.
        kme: KmeId,
        /// Initial rate estimate (bits/s).
        rate: f64,
        /// Block TTL on that link, seconds.
        ttl_secs: u64,
    },
    /// Fresh rate estimate for a link.
    UpdateLink {
        /// The link.
        link_id: LinkId,
        /// Rate estimate (bits/s).
        rate: f64,
    },
    /// An application side wants a connection.
    RegisterApp {
        /// Master application.
        src: AppId,
        /// Slave application.
        dst: AppId,
        /// KME the caller is attached to.
        kme: KmeId,
        /// Requested QoS.
        qos: Qos,
        /// True if the caller is the master side.
        master: bool,
    },
    /// The first hop closed a session.
    CloseConnection {
        /// Session being closed.
        ksid: Ksid,
    },
}

impl ControllerRequest {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterKme { .. } => "register_kme",
            Self::NewLink { .. } => "new_link",
            Self::UpdateLink { .. } => "update_link",
            Self::RegisterApp { .. } => "register_app",
            Self::CloseConnection { .. } => "close_connection",
        }
    }
}

/// Controller replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerResponse {
    /// Done, nothing to return.
    Ack,
    /// Identifier assigned to a newly registered KME.
    KmeRegistered(KmeId),
    /// Registration outcome.
    Session(Registration),
    /// The request failed.
    Error(ErrorReply),
}

impl ControllerResponse {
    /// Lifts an error reply into `Err`.
    ///
    /// # Errors
    ///
    /// [`QkdError::Remote`] carrying the reply's kind.
    pub fn into_result(self) -> Result<Self, QkdError> {
        match self {
            Self::Error(reply) => Err(reply.into()),
            other => Ok(other),
        }
    }
}

/// CBOR-encodes a message.
///
/// # Errors
///
/// `ProtocolViolation` if serialization fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, QkdError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| QkdError::ProtocolViolation(format!("encode failed: {e}")))?;
    Ok(bytes)
}

/// Decodes a CBOR message.
///
/// # Errors
///
/// `ProtocolViolation` on malformed input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, QkdError> {
    ciborium::from_reader(bytes)
        .map_err(|e| QkdError::ProtocolViolation(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn relay_forward_survives_the_wire() {
        let request = KmeRequest::RelayForward {
            ksid: Ksid(1),
            key_id: KeyId(u128::MAX),
            otk_id: KeyId(3),
            cipher: "AAECAw==".to_string(),
            size: 32,
        };

        let decoded: KmeRequest = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn error_reply_becomes_err() {
        let response = KmeResponse::Error(ErrorReply {
            kind: ErrorKind::PeerUnreachable,
            message: "down".to_string(),
        });

        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerUnreachable);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode(&ControllerRequest::CloseConnection { ksid: Ksid(9) }).unwrap();
        let result: Result<ControllerRequest, _> = decode(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }
}
