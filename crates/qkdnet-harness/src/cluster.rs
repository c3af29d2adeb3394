//! A whole QKD network in one process.
//!
//! [`SimCluster`] wires a controller and a set of KMEs to one
//! [`SimNetwork`], registers the KMEs the way a deployment would, and
//! exposes the application-facing calls. Every call, including those the
//! test makes on behalf of applications, crosses the simulated network.

use std::sync::Arc;

use qkdnet_controller::{ControllerDriver, ControllerNode};
use qkdnet_core::{
    AppId, ControllerConfig, KeyId, KmeConfig, KmeId, Ksid, LinkId, Peer, PeerNetwork, QkdError,
    Qos, Registration,
    message::{KeyContainer, KmeRequest, KmeResponse, StatusReport},
};
use qkdnet_kme::{KmeDriver, KmeNode, MemoryStorage, register};

use crate::{
    SimEnv, SimNetwork,
    invariants::{EdgeSnapshot, KmeSession, KmeSnapshot, NetworkSnapshot},
    quantum::QuantumChannel,
};

/// Default bytes per simulated block.
pub const BLOCK_SIZE: usize = 1024;

/// A simulated KME.
pub type SimKme = KmeNode<SimEnv, MemoryStorage>;

/// Controller, KMEs and quantum channels sharing one simulated network.
pub struct SimCluster {
    /// Shared clock and RNG.
    pub env: SimEnv,
    /// The network every node talks over.
    pub network: SimNetwork,
    /// The controller.
    pub controller: Arc<ControllerNode<SimEnv>>,
    kmes: Vec<Arc<SimKme>>,
    storages: Vec<MemoryStorage>,
    channels: Vec<QuantumChannel>,
}

impl SimCluster {
    /// Cluster of `kme_count` KMEs with default configurations.
    ///
    /// # Errors
    ///
    /// Whatever registration with the controller fails with.
    pub async fn new(seed: u64, kme_count: usize) -> Result<Self, QkdError> {
        Self::with_config(seed, kme_count, KmeConfig::default(), ControllerConfig::default()).await
    }

    /// Cluster with explicit configurations.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an inconsistent configuration, or whatever
    /// registration with the controller fails with.
    pub async fn with_config(
        seed: u64,
        kme_count: usize,
        kme_config: KmeConfig,
        controller_config: ControllerConfig,
    ) -> Result<Self, QkdError> {
        let env = SimEnv::with_seed(seed);
        let network = SimNetwork::new();

        let driver = ControllerDriver::new(env.clone(), controller_config)?;
        let controller = Arc::new(ControllerNode::new(driver, Arc::new(network.clone())));
        network.set_controller(controller.clone());

        let mut kmes = Vec::with_capacity(kme_count);
        let mut storages = Vec::with_capacity(kme_count);
        for index in 0..kme_count {
            let id = register(&network, &format!("sim://kme-{index}")).await?;
            let storage = MemoryStorage::new();
            let driver = KmeDriver::open(env.clone(), id, kme_config.clone(), storage.clone())?;
            let node = Arc::new(KmeNode::new(driver, Arc::new(network.clone())));
            network.add_kme(id, node.clone());
            kmes.push(node);
            storages.push(storage);
        }

        tracing::debug!(seed, kme_count, "cluster up");
        Ok(Self { env, network, controller, kmes, storages, channels: Vec::new() })
    }

    /// KME by index.
    pub fn kme(&self, index: usize) -> &Arc<SimKme> {
        &self.kmes[index]
    }

    /// Identifier of the KME at `index`.
    pub fn id(&self, index: usize) -> KmeId {
        self.kmes[index].id()
    }

    /// Storage behind the KME at `index`.
    pub fn storage(&self, index: usize) -> &MemoryStorage {
        &self.storages[index]
    }

    /// Number of KMEs.
    pub fn len(&self) -> usize {
        self.kmes.len()
    }

    /// True for a cluster without KMEs.
    pub fn is_empty(&self) -> bool {
        self.kmes.is_empty()
    }

    /// Opens a quantum channel between two KMEs and delivers `blocks`
    /// blocks of [`BLOCK_SIZE`] bytes over it. The second delivery confirms
    /// the link at the controller.
    ///
    /// # Errors
    ///
    /// The first failed delivery.
    pub async fn connect(&mut self, a: usize, b: usize, blocks: usize) -> Result<LinkId, QkdError> {
        self.connect_sized(a, b, BLOCK_SIZE, blocks).await
    }

    /// Like [`Self::connect`] with an explicit block size, which sets the
    /// link's rate to `block_size * 8` bits/s.
    ///
    /// # Errors
    ///
    /// The first failed delivery.
    pub async fn connect_sized(
        &mut self,
        a: usize,
        b: usize,
        block_size: usize,
        blocks: usize,
    ) -> Result<LinkId, QkdError> {
        let channel = QuantumChannel::new(self.env.clone(), self.id(a), self.id(b), block_size);
        channel.deliver_many(&self.network, blocks).await?;

        let link_id = channel.link_id;
        self.channels.push(channel);
        Ok(link_id)
    }

    /// Delivers `blocks` more blocks on every channel.
    ///
    /// # Errors
    ///
    /// The first failed delivery.
    pub async fn feed(&self, blocks: usize) -> Result<(), QkdError> {
        for channel in &self.channels {
            channel.deliver_many(&self.network, blocks).await?;
        }
        Ok(())
    }

    async fn call(&self, index: usize, request: KmeRequest) -> Result<KmeResponse, QkdError> {
        let kme = self.id(index);
        self.network
            .call_kme(kme, request)
            .await
            .map_err(|e| e.unreachable(Peer::Kme(kme)))?
            .into_result()
    }

    /// Registers one side of a connection at the KME at `index`.
    ///
    /// # Errors
    ///
    /// Whatever the KME answered with.
    pub async fn register_app(
        &self,
        index: usize,
        src: AppId,
        dst: AppId,
        qos: Qos,
        master: bool,
    ) -> Result<Registration, QkdError> {
        match self.call(index, KmeRequest::OpenSession { src, dst, qos, master }).await? {
            KmeResponse::Session(registration) => Ok(registration),
            other => Err(unexpected("open_session", &other)),
        }
    }

    /// Registers the slave at `dst_kme`, then the master at `src_kme`, and
    /// returns the session the second registration produced.
    ///
    /// # Errors
    ///
    /// The admission error, or `ProtocolViolation` if the pair did not match.
    pub async fn open_session(
        &self,
        (src_kme, src): (usize, AppId),
        (dst_kme, dst): (usize, AppId),
        qos: Qos,
    ) -> Result<Ksid, QkdError> {
        let slave = self.register_app(dst_kme, src, dst, qos, false).await?;
        if slave != Registration::Pending {
            return Err(QkdError::ProtocolViolation(format!("slave registration gave {slave:?}")));
        }
        match self.register_app(src_kme, src, dst, qos, true).await? {
            Registration::Registered(ksid) => Ok(ksid),
            Registration::Pending => {
                Err(QkdError::ProtocolViolation("master registration left pending".to_string()))
            },
        }
    }

    /// Master side: fetches `number` new keys.
    ///
    /// # Errors
    ///
    /// Whatever the KME answered with.
    pub async fn enc_keys(
        &self,
        index: usize,
        src: AppId,
        dst: AppId,
        number: u32,
        size: Option<u32>,
    ) -> Result<Vec<KeyContainer>, QkdError> {
        match self.call(index, KmeRequest::EncKeys { src, dst, number, size }).await? {
            KmeResponse::Keys(keys) => Ok(keys),
            other => Err(unexpected("enc_keys", &other)),
        }
    }

    /// Slave side: fetches keys by id.
    ///
    /// # Errors
    ///
    /// Whatever the KME answered with.
    pub async fn dec_keys(
        &self,
        index: usize,
        src: AppId,
        dst: AppId,
        key_ids: Vec<KeyId>,
    ) -> Result<Vec<KeyContainer>, QkdError> {
        match self.call(index, KmeRequest::DecKeys { src, dst, key_ids }).await? {
            KmeResponse::Keys(keys) => Ok(keys),
            other => Err(unexpected("dec_keys", &other)),
        }
    }

    /// Session status as the KME at `index` reports it.
    ///
    /// # Errors
    ///
    /// Whatever the KME answered with.
    pub async fn status(
        &self,
        index: usize,
        src: AppId,
        dst: AppId,
    ) -> Result<StatusReport, QkdError> {
        match self.call(index, KmeRequest::Status { src, dst }).await? {
            KmeResponse::Status(report) => Ok(report),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Closes a session at the KME at `index`; the close spreads along the
    /// path from there.
    ///
    /// # Errors
    ///
    /// Whatever the KME answered with.
    pub async fn close(&self, index: usize, ksid: Ksid) -> Result<(), QkdError> {
        self.call(index, KmeRequest::CloseSession { ksid, from: None }).await.map(|_| ())
    }

    /// Captures the controller's and every KME's state.
    pub async fn snapshot(&self) -> NetworkSnapshot {
        let now = self.env.elapsed();
        let (edges, sessions) = self
            .controller
            .inspect(|driver| {
                let edges = driver
                    .graph()
                    .edges()
                    .map(|(ends, edge)| EdgeSnapshot {
                        ends,
                        capacity: edge.capacity(now),
                        reserved: edge.reserved(),
                    })
                    .collect::<Vec<_>>();
                let directory = driver.directory();
                let sessions = directory
                    .sessions()
                    .iter()
                    .filter_map(|record| {
                        let reservation = directory.reservation(record.ksid)?;
                        Some((record.clone(), reservation.clone()))
                    })
                    .collect::<Vec<_>>();
                (edges, sessions)
            })
            .await;

        let mut kmes = Vec::with_capacity(self.kmes.len());
        for node in &self.kmes {
            let snapshot = node
                .inspect(|driver| KmeSnapshot {
                    id: driver.id(),
                    sessions: driver
                        .sessions()
                        .iter()
                        .map(|record| KmeSession {
                            record: record.clone(),
                            stored_keys: driver.keys().session_key_count(record.ksid).unwrap_or(0),
                        })
                        .collect(),
                })
                .await;
            kmes.push(snapshot);
        }

        NetworkSnapshot { edges, sessions, kmes }
    }
}

fn unexpected(request: &str, response: &KmeResponse) -> QkdError {
    QkdError::ProtocolViolation(format!("{request} answered with {response:?}"))
}
