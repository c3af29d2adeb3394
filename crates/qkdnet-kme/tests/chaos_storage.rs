//! Fault-injection tests for key generation.
//!
//! A generation batch is one transaction: whichever storage call fails, the
//! pool must end up exactly as it was before the batch, with no orphan local
//! keys.

#![allow(clippy::disallowed_types, reason = "Test environment state")]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use proptest::prelude::*;
use qkdnet_core::{Block, BlockId, Environment, Ksid, LinkId};
use qkdnet_kme::{ChaoticStorage, Generation, KeyEngine, MemoryStorage, RedbStorage, Storage};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

#[derive(Clone)]
struct TestEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
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

const LINK: LinkId = LinkId(3);
const KSID: Ksid = Ksid(11);

fn snapshot<S: Storage>(storage: &S) -> Vec<(BlockId, usize, u32)> {
    let mut blocks: Vec<(BlockId, usize, u32)> = storage
        .list_blocks()
        .unwrap()
        .iter()
        .map(|b: &Block| (b.id, b.offset, b.in_use))
        .collect();
    blocks.sort();
    blocks
}

fn chaotic_engine(
    seed: u64,
    blocks: usize,
) -> (KeyEngine<TestEnv, ChaoticStorage<MemoryStorage>>, ChaoticStorage<MemoryStorage>) {
    let env = TestEnv { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))) };
    let chaotic = ChaoticStorage::new(MemoryStorage::new(), 0.0);
    let mut engine = KeyEngine::new(env, chaotic.clone(), Duration::from_secs(15)).unwrap();
    for i in 0..blocks {
        engine.blocks_mut().ingest(LINK, BlockId(i as u128 + 1), vec![i as u8; 24], 100).unwrap();
    }
    (engine, chaotic)
}

#[test]
fn prop_failed_generation_leaves_no_trace() {
    proptest!(|(
        seed in any::<u64>(),
        fail_at in 1usize..40,
        count in 1usize..5,
        keep_local in 0usize..3,
    )| {
        let (engine, chaotic) = chaotic_engine(seed, 4);
        let before = snapshot(chaotic.inner());

        chaotic.fail_on(chaotic.operation_count() + fail_at);
        let result = engine.generate(Generation {
            ksid: KSID,
            link_id: LINK,
            size_bits: 128,
            count,
            keep_local: keep_local.min(count),
        });

        match result {
            Ok(batch) => {
                prop_assert_eq!(batch.issued.len() + batch.stored.len(), count);
                prop_assert_eq!(chaotic.inner().local_key_count(), batch.stored.len());
            },
            Err(_) => {
                prop_assert_eq!(chaotic.failure_count(), 1);

                // ORACLE: the pool is untouched and no local key leaked
                prop_assert_eq!(snapshot(chaotic.inner()), before);
                prop_assert_eq!(chaotic.inner().local_key_count(), 0);
            },
        }
    });
}

#[test]
fn every_failure_point_rolls_back_on_redb() {
    let dir = tempdir().unwrap();
    let env = TestEnv { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(7))) };
    let generation =
        Generation { ksid: KSID, link_id: LINK, size_bits: 128, count: 3, keep_local: 1 };

    // Count the storage calls of a clean run
    let clean_ops = {
        let chaotic =
            ChaoticStorage::new(RedbStorage::open(dir.path().join("clean.redb")).unwrap(), 0.0);
        let mut engine =
            KeyEngine::new(env.clone(), chaotic.clone(), Duration::from_secs(15)).unwrap();
        engine.blocks_mut().ingest(LINK, BlockId(1), vec![1; 20], 100).unwrap();
        engine.blocks_mut().ingest(LINK, BlockId(2), vec![2; 40], 100).unwrap();
        let start = chaotic.operation_count();
        engine.generate(generation).unwrap();
        chaotic.operation_count() - start
    };

    for fail_at in 1..=clean_ops {
        let path = dir.path().join(format!("fail-{fail_at}.redb"));
        let chaotic = ChaoticStorage::new(RedbStorage::open(&path).unwrap(), 0.0);
        let mut engine =
            KeyEngine::new(env.clone(), chaotic.clone(), Duration::from_secs(15)).unwrap();
        engine.blocks_mut().ingest(LINK, BlockId(1), vec![1; 20], 100).unwrap();
        engine.blocks_mut().ingest(LINK, BlockId(2), vec![2; 40], 100).unwrap();
        let before = snapshot(chaotic.inner());

        chaotic.fail_on(chaotic.operation_count() + fail_at);
        assert!(engine.generate(generation).is_err(), "failure at {fail_at} went unnoticed");

        assert_eq!(snapshot(chaotic.inner()), before, "pool changed after failure at {fail_at}");
        assert_eq!(chaotic.inner().count_session_keys(KSID).unwrap(), 0);
    }
}

#[test]
fn redb_generation_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kme.redb");
    let env = TestEnv { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(1))) };

    let stored = {
        let storage = RedbStorage::open(&path).unwrap();
        let mut engine = KeyEngine::new(env.clone(), storage, Duration::from_secs(15)).unwrap();
        engine.blocks_mut().ingest(LINK, BlockId(1), (0..64).collect(), 100).unwrap();
        let batch = engine
            .generate(Generation {
                ksid: KSID,
                link_id: LINK,
                size_bits: 128,
                count: 2,
                keep_local: 1,
            })
            .unwrap();
        batch.stored
    };

    let storage = RedbStorage::open(&path).unwrap();
    let engine = KeyEngine::new(env, storage, Duration::from_secs(15)).unwrap();

    assert_eq!(engine.available(LINK).unwrap(), 32);
    let key = engine.take_prefetched(KSID, 128).unwrap().unwrap();
    assert_eq!(key.key_id, stored[0].key_id);
    assert_eq!(key.material, stored[0].material);
}
