//! Fuzz target for wire message decoding
//!
//! Every request a KME or the controller serves arrives as CBOR from an
//! untrusted peer.
//!
//! # Invariants
//!
//! - Decoding arbitrary bytes NEVER panics
//! - Anything that decodes re-encodes to a message that decodes to itself
//! - Key material in decoded messages is only accepted as valid base64

#![no_main]

use libfuzzer_sys::fuzz_target;
use qkdnet_core::{
    KeyMaterial,
    message::{ControllerRequest, ControllerResponse, KmeRequest, KmeResponse, decode, encode},
};

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = decode::<KmeRequest>(data) {
        let bytes = encode(&request).expect("decoded request must encode");
        let again: KmeRequest = decode(&bytes).expect("re-encoded request must decode");
        assert_eq!(again, request);

        if let KmeRequest::RelayForward { cipher, .. } = &request {
            let _ = KeyMaterial::decode(cipher);
        }
    }

    if let Ok(request) = decode::<ControllerRequest>(data) {
        let bytes = encode(&request).expect("decoded request must encode");
        let again: ControllerRequest = decode(&bytes).expect("re-encoded request must decode");
        // Rates may be NaN, so compare encodings
        assert_eq!(encode(&again).expect("encode"), bytes);
    }

    if let Ok(response) = decode::<KmeResponse>(data) {
        let bytes = encode(&response).expect("decoded response must encode");
        assert_eq!(decode::<KmeResponse>(&bytes).ok(), Some(response.clone()));

        if let KmeResponse::Keys(keys) = response {
            for key in keys {
                let _ = KeyMaterial::decode(&key.key);
            }
        }
    }

    let _ = decode::<ControllerResponse>(data);
});
