//! Strongly-typed 128-bit identifiers.
//!
//! All identifiers are random `u128`s rendered in UUID layout, so a key id
//! can never be passed where a session id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::env::Environment;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u128);

        impl $name {
            /// Draws a fresh identifier from the environment's RNG.
            pub fn random<E: Environment>(env: &E) -> Self {
                Self(env.random_u128())
            }

            /// Big-endian encoding, used for ordered storage keys.
            pub fn to_be_bytes(self) -> [u8; 16] {
                self.0.to_be_bytes()
            }

            /// Inverse of [`Self::to_be_bytes`].
            pub fn from_be_bytes(bytes: [u8; 16]) -> Self {
                Self(u128::from_be_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let v = self.0;
                write!(
                    f,
                    "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
                    (v >> 96) as u32,
                    (v >> 80) as u16,
                    (v >> 64) as u16,
                    (v >> 48) as u16,
                    (v & 0xffff_ffff_ffff) as u64,
                )
            }
        }

        impl From<u128> for $name {
            fn from(raw: u128) -> Self {
                Self(raw)
            }
        }
    };
}

define_id!(
    /// A Key Management Entity (network node).
    KmeId
);
define_id!(
    /// A quantum channel between two adjacent KMEs.
    LinkId
);
define_id!(
    /// A block of shared random bytes delivered over one link.
    BlockId
);
define_id!(
    /// A key, either application-facing or a one-time relay key.
    KeyId
);
define_id!(
    /// An end-to-end session between two applications.
    Ksid
);
define_id!(
    /// An application (SAE) attached to a KME.
    AppId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_uuid_layout() {
        let id = KeyId(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        assert_eq!(id.to_string(), "01234567-89ab-cdef-0011-223344556677");
    }

    #[test]
    fn byte_encoding_preserves_order() {
        let a = LinkId(5);
        let b = LinkId(1 << 100);
        assert!(a.to_be_bytes() < b.to_be_bytes());
        assert_eq!(LinkId::from_be_bytes(b.to_be_bytes()), b);
    }
}
