//! Relay Protocol Engine: per-hop role and the chained-XOR combine.
//!
//! A session's path fixes each KME's role once. The first hop masks the
//! application key `K` with a one-time key `E0` carved from its first link
//! and forwards `C0 = K ^ E0`. Each later hop replays its copy of the
//! one-time key from the instruction rows synced beforehand, recovers `K`,
//! and either re-masks it for the next link or, at the last hop, stores it
//! for the slave application.
//!
//! Key bytes only travel masked. Intermediate hops hold `K` in memory for
//! the duration of one request and never persist it.

use qkdnet_core::{KeyMaterial, KmeId, QkdError, SessionRecord};

/// Role of one KME in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Both applications hang off this KME or its direct neighbour.
    /// `companion` is `None` when both are local.
    Direct {
        /// The neighbour sharing the link, if any.
        companion: Option<KmeId>,
    },
    /// Master's KME on a multi-hop path.
    First {
        /// Next hop towards the slave.
        next: KmeId,
    },
    /// Intermediate hop.
    Middle {
        /// Hop towards the master.
        prev: KmeId,
        /// Hop towards the slave.
        next: KmeId,
    },
    /// Slave's KME on a multi-hop path.
    Last {
        /// Hop towards the master.
        prev: KmeId,
    },
}

impl RelayState {
    /// Role of `me` on the session's path.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if `me` is not on the path.
    pub fn resolve(record: &SessionRecord, me: KmeId) -> Result<Self, QkdError> {
        let position = record.position(me).ok_or_else(|| {
            QkdError::ProtocolViolation(format!("kme {me} is not on the path of {}", record.ksid))
        })?;

        let last = record.path.len() - 1;
        let state = match (record.path.len(), position) {
            (1, _) => Self::Direct { companion: None },
            (2, 0) => Self::Direct { companion: Some(record.path[1]) },
            (2, _) => Self::Direct { companion: Some(record.path[0]) },
            (_, 0) => Self::First { next: record.path[1] },
            (_, p) if p == last => Self::Last { prev: record.path[p - 1] },
            (_, p) => Self::Middle { prev: record.path[p - 1], next: record.path[p + 1] },
        };
        Ok(state)
    }

    /// Neighbours of this hop, previous first.
    pub fn neighbours(&self) -> Vec<KmeId> {
        match *self {
            Self::Direct { companion } => companion.into_iter().collect(),
            Self::First { next } => vec![next],
            Self::Middle { prev, next } => vec![prev, next],
            Self::Last { prev } => vec![prev],
        }
    }
}

/// Masks a key for the next hop: base64 of `key ^ otk`.
///
/// # Errors
///
/// `ProtocolViolation` if the lengths differ.
pub fn wrap(key: &KeyMaterial, otk: &KeyMaterial) -> Result<String, QkdError> {
    Ok(key.xor(otk)?.encode())
}

/// Recovers a key from a masked transmission.
///
/// # Errors
///
/// `ProtocolViolation` if the cipher is not valid base64, is not
/// `size_bits` long, or differs in length from the one-time key.
pub fn unwrap(cipher: &str, otk: &KeyMaterial, size_bits: u32) -> Result<KeyMaterial, QkdError> {
    let cipher = KeyMaterial::decode(cipher)?;
    if cipher.bit_len() != size_bits as usize {
        return Err(QkdError::ProtocolViolation(format!(
            "relayed cipher is {} bits, announced {size_bits}",
            cipher.bit_len()
        )));
    }
    cipher.xor(otk)
}
