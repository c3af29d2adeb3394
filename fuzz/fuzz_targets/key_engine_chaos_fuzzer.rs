//! Fuzz target for key generation and companion replay under storage
//! failures
//!
//! Two key engines share a link. The generating side runs on
//! ChaoticStorage; the companion mirrors every batch that succeeded and
//! replays its keys.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%) on the generating side
//! - Mixed block sizes, key sizes and batch shapes
//! - Clock jumps past the block TTL between operations
//!
//! # Invariants
//!
//! - Storage errors surface as Err, NEVER as panics
//! - Without injected failures, a failed batch consumes nothing
//! - Every key of a successful batch replays to the same bytes
//! - Keys never share a byte range

#![no_main]

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qkdnet_core::{BlockId, Environment, Ksid, LinkId};
use qkdnet_kme::{ChaoticStorage, Generation, KeyEngine, MemoryStorage};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const LINK: LinkId = LinkId(1);
const KSID: Ksid = Ksid(1);
const TTL: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct FuzzEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
    clock: Arc<AtomicU64>,
}

impl Environment for FuzzEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_secs(self.clock.load(Ordering::SeqCst))
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }

    fn wall_clock_secs(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    seed: u64,
    chaos_seed: u64,
    /// 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    Deliver { len: u8 },
    Generate { size_bytes: u8, count: u8, keep_local: u8 },
    Advance { secs: u8 },
}

fuzz_target!(|scenario: ChaosScenario| {
    let env = FuzzEnv {
        rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(scenario.seed))),
        clock: Arc::new(AtomicU64::new(1_000)),
    };
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let storage =
        ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);

    let Ok(mut master) = KeyEngine::new(env.clone(), storage, TTL) else { return };
    let mut companion = KeyEngine::new(env.clone(), MemoryStorage::new(), TTL).unwrap();

    let mut next_block = 1u128;
    let mut seen = HashSet::new();

    for op in scenario.operations.into_iter().take(64) {
        match op {
            Operation::Deliver { len } => {
                let mut bytes = vec![0u8; usize::from(len).max(1)];
                env.random_bytes(&mut bytes);
                let now = env.wall_clock_secs();
                let block_id = BlockId(next_block);
                next_block += 1;

                // Both ends must hold the block for replay to be possible
                if master.blocks_mut().ingest(LINK, block_id, bytes.clone(), now).is_err() {
                    continue;
                }
                companion.blocks_mut().ingest(LINK, block_id, bytes, now).unwrap();
            }

            Operation::Generate { size_bytes, count, keep_local } => {
                let size_bits = u32::from(size_bytes % 32 + 1) * 8;
                let count = usize::from(count % 8) + 1;
                let keep_local = usize::from(keep_local) % (count + 1);
                let before = master.available(LINK).ok();

                let generation =
                    Generation { ksid: KSID, link_id: LINK, size_bits, count, keep_local };
                let Ok(batch) = master.generate(generation) else {
                    // Rollback itself may hit an injected failure
                    if failure_rate == 0.0 {
                        let after = master.available(LINK).ok();
                        assert_eq!(before, after, "failed batch consumed bytes");
                    }
                    continue;
                };

                for range in batch.consumed() {
                    for byte in range.start..range.end {
                        assert!(seen.insert((range.block_id, byte)), "byte handed out twice");
                    }
                }

                let now = env.wall_clock_secs();
                let rows = batch.rows(KSID, false, now);
                companion.apply_sync(LINK, &rows, &batch.consumed()).unwrap();
                for key in batch.issued.iter().chain(&batch.stored) {
                    let replayed = companion.reconstruct(KSID, key.key_id).unwrap();
                    assert_eq!(replayed, key.material);
                }
            }

            Operation::Advance { secs } => {
                env.clock.fetch_add(u64::from(secs % 20), Ordering::SeqCst);
                let _ = master.sweep();
                companion.sweep().unwrap();
            }
        }
    }
});
