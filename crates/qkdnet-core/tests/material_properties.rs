//! Property-based tests for key material handling.

use proptest::prelude::*;
use qkdnet_core::{Block, BlockId, KeyMaterial, LinkId, block::total_len};

/// Max key size used by the default configuration, in bytes.
const MAX_KEY_BYTES: usize = 1024 / 8;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the base64 transport encoding round-trips every byte string
    /// up to the maximum key size.
    #[test]
    fn prop_encoding_roundtrip(bytes in prop::collection::vec(any::<u8>(), 0..=MAX_KEY_BYTES)) {
        let key = KeyMaterial::new(bytes.clone());
        let decoded = KeyMaterial::decode(&key.encode())?;

        // ORACLE: decoding yields the original bytes
        prop_assert_eq!(decoded.as_bytes(), bytes.as_slice());
    }

    /// Property: masking then unmasking with the same one-time key restores
    /// the key.
    #[test]
    fn prop_xor_is_self_inverse(
        pair in (1usize..=MAX_KEY_BYTES).prop_flat_map(|n| (
            prop::collection::vec(any::<u8>(), n),
            prop::collection::vec(any::<u8>(), n),
        ))
    ) {
        let (k, e) = pair;
        let key = KeyMaterial::new(k);
        let otk = KeyMaterial::new(e);

        let cipher = key.xor(&otk)?;

        // ORACLE: decrypt(encrypt(K, E), E) == K
        prop_assert_eq!(cipher.xor(&otk)?, key);
    }

    /// Property: carving a block in arbitrary chunk sizes hands out disjoint
    /// ranges that together cover exactly the consumed prefix.
    #[test]
    fn prop_block_carves_are_disjoint(
        len in 1usize..512,
        chunks in prop::collection::vec(1usize..64, 1..32),
    ) {
        let mut block = Block::new(BlockId(1), LinkId(1), 0, 0, vec![0; len]);
        let mut carved = Vec::new();

        for chunk in chunks {
            if let Some(instruction) = block.carve(chunk) {
                carved.push(instruction);
            }
        }

        for (i, a) in carved.iter().enumerate() {
            for b in &carved[i + 1..] {
                // ORACLE: no two carves share a byte
                prop_assert!(!a.overlaps(b));
            }
        }

        // ORACLE: consumed bytes equal the cursor
        prop_assert_eq!(total_len(&carved), block.offset);
        prop_assert_eq!(block.in_use as usize, carved.len());
    }
}
