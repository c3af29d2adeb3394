//! Key material and its transport encoding.
//!
//! Material is wiped on drop and never printed. On the wire it travels as
//! standard base64, and the relay combine is a strict byte-wise XOR: two
//! operands of different length are a protocol violation, never padded or
//! truncated.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::QkdError;

/// Raw key bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    /// Wraps raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Concatenates byte slices in order.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut bytes = Vec::new();
        for part in parts {
            bytes.extend_from_slice(part);
        }
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for zero-length material.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in bits.
    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Byte-wise XOR with an equal-length mask.
    ///
    /// Used both to wrap a relayed key (`C = K ^ E`) and to unwrap it
    /// (`K = C ^ E`).
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the lengths differ.
    pub fn xor(&self, mask: &KeyMaterial) -> Result<KeyMaterial, QkdError> {
        if self.len() != mask.len() {
            return Err(QkdError::ProtocolViolation(format!(
                "xor operands differ in length: {} vs {} bytes",
                self.len(),
                mask.len()
            )));
        }

        Ok(Self(self.0.iter().zip(mask.0.iter()).map(|(a, b)| a ^ b).collect()))
    }

    /// Base64 transport encoding.
    pub fn encode(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Decodes the base64 transport encoding.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the input is not valid base64.
    pub fn decode(encoded: &str) -> Result<Self, QkdError> {
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(|e| QkdError::ProtocolViolation(format!("bad key encoding: {e}")))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_rejects_length_mismatch() {
        let k = KeyMaterial::new(vec![1, 2, 3, 4]);
        let e = KeyMaterial::new(vec![9, 9, 9]);

        assert!(matches!(k.xor(&e), Err(QkdError::ProtocolViolation(_))));
    }

    #[test]
    fn xor_with_self_is_zero() {
        let k = KeyMaterial::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(k.xor(&k).unwrap().as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn empty_material_encodes_to_empty_string() {
        let k = KeyMaterial::new(Vec::new());
        assert_eq!(k.encode(), "");
        assert!(KeyMaterial::decode("").unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(KeyMaterial::decode("not base64!").is_err());
    }

    #[test]
    fn debug_does_not_leak_bytes() {
        let k = KeyMaterial::new(vec![0x41; 4]);
        assert_eq!(format!("{k:?}"), "KeyMaterial(4 bytes)");
    }

    #[test]
    fn concat_preserves_order() {
        let k = KeyMaterial::concat([&[1u8, 2][..], &[3u8][..]]);
        assert_eq!(k.as_bytes(), &[1, 2, 3]);
        assert_eq!(k.bit_len(), 24);
    }
}
