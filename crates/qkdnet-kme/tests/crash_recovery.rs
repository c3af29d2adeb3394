//! KME restart on a persistent store.
//!
//! Links, sessions, pending instruction rows and block cursors live in redb.
//! A KME reopened on the same file serves the slave application as if it
//! had never stopped.

#![allow(clippy::disallowed_types, reason = "Test environment state")]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use qkdnet_core::{
    AppId, BlockId, Environment, KmeConfig, KmeId, Ksid, LinkId, Qos, SessionRecord,
    message::{KmeRequest, KmeResponse},
};
use qkdnet_kme::{KmeAction, KmeDriver, MemoryStorage, RedbStorage, Reply, Storage};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

#[derive(Clone)]
struct TestEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl TestEnv {
    fn new(seed: u64) -> Self {
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
        500
    }
}

const LINK: LinkId = LinkId(9);
const MASTER: KmeId = KmeId(1);
const SLAVE: KmeId = KmeId(2);

fn record() -> SessionRecord {
    SessionRecord {
        ksid: Ksid(4),
        src: AppId(100),
        dst: AppId(200),
        kme_src: MASTER,
        kme_dst: SLAVE,
        qos: Qos { key_chunk_size: 256, request_interval_ms: 1000 },
        path: vec![MASTER, SLAVE],
        created_at: 500,
    }
}

fn setup<S: Storage>(driver: &mut KmeDriver<TestEnv, S>, companion: KmeId) {
    driver
        .handle(KmeRequest::DeliverBlock {
            link_id: LINK,
            block_id: BlockId(1),
            timestamp: 500,
            bytes: (0..128).collect(),
        })
        .unwrap();
    driver
        .handle(KmeRequest::LinkConfirmed {
            link_id: LINK,
            companion,
            address: "127.0.0.1:7000".to_string(),
        })
        .unwrap();
    driver.handle(KmeRequest::AssignSession { record: record() }).unwrap();
}

#[test]
fn slave_serves_keys_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("slave.redb");

    let mut master =
        KmeDriver::open(TestEnv::new(1), MASTER, KmeConfig::default(), MemoryStorage::new())
            .unwrap();
    setup(&mut master, SLAVE);

    let step = master
        .handle(KmeRequest::EncKeys { src: AppId(100), dst: AppId(200), number: 2, size: None })
        .unwrap();
    let Reply::Ready(KmeResponse::Keys(issued)) = step.reply else {
        panic!("expected keys");
    };

    {
        let storage = RedbStorage::open(&path).unwrap();
        let mut slave = KmeDriver::open(TestEnv::new(2), SLAVE, KmeConfig::default(), storage)
            .unwrap();
        setup(&mut slave, MASTER);
        for action in step.actions {
            if let KmeAction::CallKme { kme: SLAVE, request, .. } = action {
                slave.handle(request).unwrap();
            }
        }
    }

    let storage = RedbStorage::open(&path).unwrap();
    let mut slave =
        KmeDriver::open(TestEnv::new(3), SLAVE, KmeConfig::default(), storage).unwrap();

    // ORACLE: session and link come back from disk
    assert_eq!(slave.sessions().len(), 1);
    assert_eq!(slave.link(LINK).unwrap().companion, Some(MASTER));

    let key_ids = issued.iter().map(|k| k.key_id).collect();
    let step = slave
        .handle(KmeRequest::DecKeys { src: AppId(100), dst: AppId(200), key_ids })
        .unwrap();
    assert_eq!(step.reply, Reply::Ready(KmeResponse::Keys(issued)));
}

#[test]
fn closed_session_stays_closed_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kme.redb");

    {
        let storage = RedbStorage::open(&path).unwrap();
        let mut kme =
            KmeDriver::open(TestEnv::new(1), SLAVE, KmeConfig::default(), storage).unwrap();
        setup(&mut kme, MASTER);
        kme.handle(KmeRequest::CloseSession { ksid: Ksid(4), from: Some(MASTER) }).unwrap();
    }

    let storage = RedbStorage::open(&path).unwrap();
    let kme = KmeDriver::open(TestEnv::new(2), SLAVE, KmeConfig::default(), storage).unwrap();
    assert!(kme.sessions().is_empty());
    assert!(kme.link(LINK).is_some());
}
