//! Fuzz target for hostile CBOR sent to a KME or the controller
//!
//! Any peer that can open a stream can send request bytes, so decoding must
//! survive whatever shape arrives.
//!
//! # Strategy
//!
//! - Nesting: one-element arrays or maps stacked up to 49 deep
//! - Length claims: byte strings, text and arrays announcing up to 4 GiB
//! - Arbitrary bytes
//! - Variant confusion: a real request variant name wrapping a random body
//!
//! # Invariants
//!
//! - Decoding returns (no hang, no unbounded allocation)
//! - A length claim larger than the input fails instead of allocating
//! - Malformed input is an Err, NEVER a panic

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qkdnet_core::message::{ControllerRequest, KmeRequest, decode};

#[derive(Debug, Arbitrary)]
enum CborAttack {
    Nested { depth: u8, payload_type: PayloadType },
    LengthClaim { claimed_len_exponent: u8 },
    Garbage { bytes: Vec<u8> },
    VariantConfusion { variant: u8, body: Vec<u8> },
}

#[derive(Debug, Arbitrary)]
enum PayloadType {
    Array,
    Map,
    Bytes,
    String,
}

const VARIANTS: &[&str] = &[
    "DeliverBlock",
    "OpenSession",
    "EncKeys",
    "DecKeys",
    "SyncKeys",
    "RelayForward",
    "AssignSession",
    "RegisterApp",
    "NewLink",
];

fn decode_all(bytes: &[u8]) {
    let _ = decode::<KmeRequest>(bytes);
    let _ = decode::<ControllerRequest>(bytes);
}

fuzz_target!(|attack: CborAttack| {
    match attack {
        CborAttack::Nested { depth, payload_type } => {
            decode_all(&nested(usize::from(depth % 50), &payload_type));
        }

        CborAttack::LengthClaim { claimed_len_exponent } => {
            let claimed_length = match claimed_len_exponent % 21 {
                20 => u32::MAX,
                exponent => 1u32 << exponent,
            };

            // Byte string, text string, array
            for cbor_bytes in [
                huge_item(2, claimed_length, 0xAA, 10),
                huge_item(3, claimed_length, b'x', 10),
                huge_item(4, claimed_length, 0x01, 5),
            ] {
                decode_all(&cbor_bytes);
                // Same claim inside a variant body
                for name in VARIANTS {
                    decode_all(&wrap_variant(name, &cbor_bytes));
                }
            }
        }

        CborAttack::Garbage { bytes } => decode_all(&bytes),

        CborAttack::VariantConfusion { variant, body } => {
            let name = VARIANTS[variant as usize % VARIANTS.len()];
            decode_all(&wrap_variant(name, &body));
        }
    }
});

/// Externally tagged enum layout: a one-entry map from variant name to body.
fn wrap_variant(name: &str, body: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0xA1, 0x60 | name.len() as u8];
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend_from_slice(body);
    bytes
}

fn nested(depth: usize, payload_type: &PayloadType) -> Vec<u8> {
    // (wrapper repeated `depth` times, innermost item)
    let (wrapper, leaf): (&[u8], &[u8]) = match payload_type {
        PayloadType::Array => (&[0x81], &[0x01]),
        PayloadType::Map => (&[0xA1, 0x61, b'a'], &[0x01]),
        PayloadType::Bytes => (&[0x81], &[0x41, 0x00]),
        PayloadType::String => (&[0x81], &[0x61, b'x']),
    };

    let mut bytes = wrapper.repeat(depth);
    bytes.extend_from_slice(leaf);
    bytes
}

/// A definite-length item of `major` type whose 32-bit length claims
/// `claimed_length` but is followed by at most `max_body` bytes of `fill`.
fn huge_item(major: u8, claimed_length: u32, fill: u8, max_body: usize) -> Vec<u8> {
    let mut bytes = vec![(major << 5) | 26];
    bytes.extend_from_slice(&claimed_length.to_be_bytes());
    bytes.resize(bytes.len() + (claimed_length as usize).min(max_body), fill);
    bytes
}
