//! Property-based tests for the block pool and key replay.
//!
//! These tests verify invariants that must hold for all inputs: allocations
//! never overlap, replay yields exactly the generated bytes, and sweep
//! evicts only unreferenced blocks.

#![allow(clippy::disallowed_types, reason = "Test environment state")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use proptest::prelude::*;
use qkdnet_core::{BlockId, Environment, Instruction, Ksid, LinkId};
use qkdnet_kme::{BlockStore, Generation, KeyEngine, MemoryStorage, Storage};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Clone)]
struct TestEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl TestEnv {
    fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))) }
    }
}

impl Environment for TestEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::ZERO
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }

    fn wall_clock_secs(&self) -> u64 {
        100
    }
}

const LINK: LinkId = LinkId(5);
const TTL: Duration = Duration::from_secs(15);

fn blocks_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..96), 1..8)
}

fn feed<S: Storage>(store: &mut BlockStore<S>, blocks: &[Vec<u8>]) {
    for (i, bytes) in blocks.iter().enumerate() {
        store.ingest(LINK, BlockId(i as u128 + 1), bytes.clone(), 100).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: ranges handed out on one link never overlap
    #[test]
    fn prop_reserved_ranges_are_disjoint(
        blocks in blocks_strategy(),
        requests in prop::collection::vec(1usize..64, 1..24),
    ) {
        let mut store = BlockStore::open(MemoryStorage::new(), TTL)?;
        feed(&mut store, &blocks);

        let mut granted: Vec<Instruction> = Vec::new();
        for n in requests {
            if let Ok(instructions) = store.reserve_range(LINK, n, 100) {
                let total: usize = instructions.iter().map(Instruction::len).sum();
                prop_assert_eq!(total, n);
                granted.extend(instructions);
            }
        }

        // ORACLE: pairwise disjoint
        for (i, a) in granted.iter().enumerate() {
            for b in &granted[i + 1..] {
                prop_assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    /// Property: the companion reconstructs exactly the generated bytes
    #[test]
    fn prop_reconstruct_equals_generate(
        seed in any::<u64>(),
        blocks in blocks_strategy(),
        sizes in prop::collection::vec(1u32..=16, 1..8),
    ) {
        let env = TestEnv::with_seed(seed);
        let mut a = KeyEngine::new(env.clone(), MemoryStorage::new(), TTL)?;
        let mut b = KeyEngine::new(env, MemoryStorage::new(), TTL)?;
        feed(a.blocks_mut(), &blocks);
        feed(b.blocks_mut(), &blocks);
        let ksid = Ksid(1);

        let mut expected = HashMap::new();
        for bytes in sizes {
            let generation = Generation {
                ksid,
                link_id: LINK,
                size_bits: bytes * 8,
                count: 1,
                keep_local: 0,
            };
            let Ok(batch) = a.generate(generation) else {
                continue;
            };
            b.apply_sync(LINK, &batch.rows(ksid, false, 100), &batch.consumed())?;
            for key in batch.issued {
                expected.insert(key.key_id, key.material);
            }
        }

        for (key_id, material) in expected {
            // ORACLE: bit-for-bit equality
            prop_assert_eq!(b.reconstruct(ksid, key_id)?, material);
        }

        // Every reference was released by replay
        for block in b.storage().list_blocks()? {
            prop_assert_eq!(block.in_use, 0);
        }
    }

    /// Property: sweep removes exhausted unreferenced blocks and keeps any
    /// block still in use
    #[test]
    fn prop_sweep_respects_references(
        blocks in blocks_strategy(),
        requests in prop::collection::vec(1usize..64, 1..24),
        release_mask in any::<u32>(),
    ) {
        let mut store = BlockStore::open(MemoryStorage::new(), TTL)?;
        feed(&mut store, &blocks);

        for (i, n) in requests.into_iter().enumerate() {
            if let Ok(instructions) = store.reserve_range(LINK, n, 100)
                && release_mask & (1 << (i % 32)) != 0
            {
                store.release_range(&instructions)?;
            }
        }

        let before = store.storage().list_blocks()?;
        store.sweep(100)?;
        let after: Vec<BlockId> = store.storage().list_blocks()?.iter().map(|b| b.id).collect();

        for block in before {
            let resident = after.contains(&block.id);
            if block.in_use > 0 {
                prop_assert!(resident, "referenced block {} evicted", block.id);
            } else if block.available() == 0 {
                prop_assert!(!resident, "exhausted block {} kept", block.id);
            } else {
                prop_assert!(resident);
            }
        }
    }
}
