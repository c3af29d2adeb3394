//! KME driver.
//!
//! Ties together the block pool, the key engine, the session index and the
//! relay roles. The driver is Sans-IO: [`KmeDriver::handle`] consumes one
//! request, mutates local state, and returns a [`Step`] listing the calls to
//! other KMEs or to the controller that must follow, in order. The node
//! executes them after releasing its lock.

use std::collections::HashMap;

use qkdnet_core::{
    AppId, BlockId, ConfigError, Environment, KeyId, KeyMaterial, KmeConfig, KmeId, Ksid,
    LinkId, QkdError, Qos, RateEstimator, SessionIndex, SessionRecord, SessionRef,
    message::{ControllerRequest, KeyContainer, KeyRow, KmeRequest, KmeResponse, StatusReport},
};

use crate::{
    key_engine::{Generation, KeyBatch, KeyEngine},
    relay::{self, RelayState},
    storage::{LinkRecord, Storage},
};

/// Outbound effect of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum KmeAction {
    /// Call another KME.
    CallKme {
        /// Target KME.
        kme: KmeId,
        /// Request to send.
        request: KmeRequest,
        /// If set, failure of this call fails the whole request.
        required: bool,
    },
    /// Call the controller.
    CallController {
        /// Request to send.
        request: ControllerRequest,
        /// If set, failure of this call fails the whole request.
        required: bool,
    },
    /// Record a neighbour's address in the transport.
    LearnAddress {
        /// The neighbour.
        kme: KmeId,
        /// Where it serves.
        address: String,
    },
}

impl KmeAction {
    /// True if the request fails when this action fails.
    pub fn required(&self) -> bool {
        match self {
            Self::CallKme { required, .. } | Self::CallController { required, .. } => *required,
            Self::LearnAddress { .. } => false,
        }
    }
}

/// Where the reply to the caller comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Known now; sent once every action has run.
    Ready(KmeResponse),
    /// The controller's answer to the request's `CallController` action,
    /// passed through.
    FromController,
}

/// Result of handling one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Reply for the caller.
    pub reply: Reply,
    /// Calls to make, in order.
    pub actions: Vec<KmeAction>,
    /// Local keys to drop if a required action fails.
    pub discard_on_failure: Vec<(Ksid, KeyId)>,
}

impl Step {
    fn reply(response: KmeResponse) -> Self {
        Self { reply: Reply::Ready(response), actions: Vec::new(), discard_on_failure: Vec::new() }
    }

    fn ack() -> Self {
        Self::reply(KmeResponse::Ack)
    }

    fn then(mut self, action: KmeAction) -> Self {
        self.actions.push(action);
        self
    }
}

struct LinkState {
    record: LinkRecord,
    estimator: RateEstimator,
}

/// Sans-IO state machine of one KME.
pub struct KmeDriver<E: Environment, S: Storage> {
    env: E,
    id: KmeId,
    config: KmeConfig,
    keys: KeyEngine<E, S>,
    sessions: SessionIndex,
    links: HashMap<LinkId, LinkState>,
}

impl<E: Environment, S: Storage> KmeDriver<E, S> {
    /// Opens a driver over `storage`, restoring links and sessions
    /// persisted by a previous run.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if the configuration is inconsistent.
    /// - `Storage` if persisted state cannot be read.
    pub fn open(env: E, id: KmeId, config: KmeConfig, storage: S) -> Result<Self, QkdError> {
        config.validate().map_err(|e: ConfigError| QkdError::InvalidRequest(e.to_string()))?;

        let mut sessions = SessionIndex::new();
        for record in storage.list_sessions()? {
            sessions.insert(record);
        }
        let links = storage
            .list_links()?
            .into_iter()
            .map(|record| {
                let estimator = RateEstimator::resume(record.rate);
                (record.link_id, LinkState { record, estimator })
            })
            .collect();

        let keys = KeyEngine::new(env.clone(), storage, config.ttl)?;
        tracing::info!(kme = %id, sessions = sessions.len(), "kme driver opened");

        Ok(Self { env, id, config, keys, sessions, links })
    }

    /// This KME's identifier.
    pub fn id(&self) -> KmeId {
        self.id
    }

    /// The key engine, for inspection.
    pub fn keys(&self) -> &KeyEngine<E, S> {
        &self.keys
    }

    /// Sessions this KME is on.
    pub fn sessions(&self) -> &SessionIndex {
        &self.sessions
    }

    /// Link record by id.
    pub fn link(&self, link_id: LinkId) -> Option<&LinkRecord> {
        self.links.get(&link_id).map(|state| &state.record)
    }

    /// Handles one request.
    ///
    /// # Errors
    ///
    /// Any [`QkdError`]; the request had no effect beyond what the error
    /// documents.
    pub fn handle(&mut self, request: KmeRequest) -> Result<Step, QkdError> {
        match request {
            KmeRequest::DeliverBlock { link_id, block_id, timestamp, bytes } => {
                self.deliver_block(link_id, block_id, timestamp, bytes)
            },
            KmeRequest::OpenSession { src, dst, qos, master } => {
                Ok(self.open_session(src, dst, qos, master))
            },
            KmeRequest::EncKeys { src, dst, number, size } => {
                self.sweep();
                self.enc_keys(src, dst, number, size)
            },
            KmeRequest::DecKeys { src, dst, key_ids } => {
                self.sweep();
                self.dec_keys(src, dst, &key_ids)
            },
            KmeRequest::Status { src, dst } => self.status(src, dst),
            KmeRequest::CloseSession { ksid, from } => self.close_session(ksid, from),
            KmeRequest::SyncKeys { link_id, rows, consumed } => {
                self.keys.apply_sync(link_id, &rows, &consumed)?;
                Ok(Step::ack())
            },
            KmeRequest::RelayForward { ksid, key_id, otk_id, cipher, size } => {
                self.relay_forward(ksid, key_id, otk_id, &cipher, size)
            },
            KmeRequest::AssignSession { record } => self.assign_session(record),
            KmeRequest::LinkConfirmed { link_id, companion, address } => {
                self.link_confirmed(link_id, companion, address)
            },
        }
    }

    /// Drops local keys of a request whose required action failed.
    pub fn discard_keys(&self, keys: &[(Ksid, KeyId)]) {
        for (ksid, key_id) in keys {
            if let Err(err) = self.keys.discard(*ksid, &[*key_id]) {
                tracing::warn!(%ksid, %key_id, error = %err, "failed to discard key");
            }
        }
    }

    fn sweep(&self) {
        if let Err(err) = self.keys.sweep() {
            tracing::warn!(kme = %self.id, error = %err, "sweep failed");
        }
    }

    fn deliver_block(
        &mut self,
        link_id: LinkId,
        block_id: BlockId,
        timestamp: u64,
        bytes: Vec<u8>,
    ) -> Result<Step, QkdError> {
        let len = bytes.len();
        if !self.keys.blocks_mut().ingest(link_id, block_id, bytes, timestamp)? {
            return Ok(Step::ack());
        }

        let ttl_secs = self.keys.blocks().ttl_secs();
        let state = self.links.entry(link_id).or_insert_with(|| {
            tracing::info!(%link_id, "new link");
            LinkState {
                record: LinkRecord {
                    link_id,
                    companion: None,
                    address: None,
                    rate: 0.0,
                    ttl_secs,
                    created_at: timestamp,
                },
                estimator: RateEstimator::new(),
            }
        });
        let rate = state.estimator.observe(len);
        state.record.rate = rate;
        self.keys.storage().store_link(&state.record)?;

        // Unconfirmed links keep announcing themselves.
        let request = if state.record.companion.is_none() {
            ControllerRequest::NewLink { link_id, kme: self.id, rate, ttl_secs }
        } else {
            ControllerRequest::UpdateLink { link_id, rate }
        };
        Ok(Step::ack().then(KmeAction::CallController { request, required: false }))
    }

    fn link_confirmed(
        &mut self,
        link_id: LinkId,
        companion: KmeId,
        address: String,
    ) -> Result<Step, QkdError> {
        let ttl_secs = self.keys.blocks().ttl_secs();
        let now = self.env.wall_clock_secs();
        let state = self.links.entry(link_id).or_insert_with(|| LinkState {
            record: LinkRecord {
                link_id,
                companion: None,
                address: None,
                rate: 0.0,
                ttl_secs,
                created_at: now,
            },
            estimator: RateEstimator::new(),
        });
        state.record.companion = Some(companion);
        state.record.address = Some(address.clone());
        self.keys.storage().store_link(&state.record)?;

        tracing::info!(kme = %self.id, %link_id, %companion, "link confirmed");
        Ok(Step::ack().then(KmeAction::LearnAddress { kme: companion, address }))
    }

    fn open_session(&self, src: AppId, dst: AppId, qos: Qos, master: bool) -> Step {
        Step {
            reply: Reply::FromController,
            actions: vec![KmeAction::CallController {
                request: ControllerRequest::RegisterApp { src, dst, kme: self.id, qos, master },
                required: true,
            }],
            discard_on_failure: Vec::new(),
        }
    }

    fn assign_session(&mut self, record: SessionRecord) -> Result<Step, QkdError> {
        let state = RelayState::resolve(&record, self.id)?;
        self.keys.storage().store_session(&record)?;

        tracing::info!(
            kme = %self.id,
            ksid = %record.ksid,
            hops = record.path.len(),
            role = ?state,
            "session assigned"
        );
        self.sessions.insert(record);
        Ok(Step::ack())
    }

    fn session_by_apps(&self, src: AppId, dst: AppId) -> Result<SessionRecord, QkdError> {
        self.sessions
            .by_apps(src, dst)
            .cloned()
            .ok_or(QkdError::SessionNotFound(SessionRef::Apps { src, dst }))
    }

    fn link_to(&self, companion: KmeId) -> Result<LinkId, QkdError> {
        self.links
            .values()
            .filter(|state| state.record.companion == Some(companion))
            .map(|state| state.record.link_id)
            .min()
            .ok_or(QkdError::LinkNotFound { companion })
    }

    fn check_count(&self, number: usize) -> Result<(), QkdError> {
        if number == 0 || number > self.config.max_keys_per_request as usize {
            return Err(QkdError::InvalidRequest(format!(
                "{number} keys requested, allowed 1..={}",
                self.config.max_keys_per_request
            )));
        }
        Ok(())
    }

    fn enc_keys(
        &mut self,
        src: AppId,
        dst: AppId,
        number: u32,
        size: Option<u32>,
    ) -> Result<Step, QkdError> {
        let record = self.session_by_apps(src, dst)?;
        if record.kme_src != self.id {
            return Err(QkdError::InvalidRequest(format!(
                "master of {} is attached to kme {}",
                record.ksid, record.kme_src
            )));
        }
        self.check_count(number as usize)?;
        let size_bits = self.config.resolve_key_size(size)?;

        match RelayState::resolve(&record, self.id)? {
            RelayState::Direct { companion: None } => {
                self.local_keys(&record, number as usize, size_bits)
            },
            RelayState::Direct { companion: Some(companion) } => {
                self.direct_keys(&record, companion, number as usize, size_bits)
            },
            RelayState::First { next } => {
                self.relay_first(&record, next, number as usize, size_bits)
            },
            state => Err(QkdError::ProtocolViolation(format!(
                "enc_keys on {} at non-first hop {state:?}",
                record.ksid
            ))),
        }
    }

    /// Keys kept back for later requests. Only default-size requests
    /// prefetch, so stored keys always match the size they will serve.
    fn prefetch_allowance(&self, size_bits: u32) -> usize {
        if size_bits == self.config.default_key_size { self.config.prefetch_keys } else { 0 }
    }

    /// Pops up to `number` prefetched keys.
    fn prefetched(
        &self,
        ksid: Ksid,
        number: usize,
        size_bits: u32,
    ) -> Result<Vec<(KeyId, KeyMaterial)>, QkdError> {
        let mut keys = Vec::new();
        if self.prefetch_allowance(size_bits) == 0 {
            return Ok(keys);
        }
        while keys.len() < number {
            match self.keys.take_prefetched(ksid, size_bits)? {
                Some(local) => keys.push((local.key_id, local.material)),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Generates what the prefetch store could not cover, plus a fresh
    /// prefetch allowance.
    fn top_up(
        &self,
        ksid: Ksid,
        link_id: LinkId,
        missing: usize,
        size_bits: u32,
    ) -> Result<Option<KeyBatch>, QkdError> {
        if missing == 0 {
            return Ok(None);
        }
        let prefetch = self.prefetch_allowance(size_bits);
        let count = missing + prefetch;
        let generation = Generation { ksid, link_id, size_bits, count, keep_local: prefetch };
        self.keys.generate(generation).map(Some)
    }

    fn direct_keys(
        &self,
        record: &SessionRecord,
        companion: KmeId,
        number: usize,
        size_bits: u32,
    ) -> Result<Step, QkdError> {
        let ksid = record.ksid;
        let link_id = self.link_to(companion)?;

        let mut keys = self.prefetched(ksid, number, size_bits)?;
        let mut step = Step::ack();

        if let Some(batch) = self.top_up(ksid, link_id, number - keys.len(), size_bits)? {
            let rows = batch.rows(ksid, false, self.env.wall_clock_secs());
            step.discard_on_failure = batch.stored_ids().into_iter().map(|id| (ksid, id)).collect();
            step.actions.push(KmeAction::CallKme {
                kme: companion,
                request: KmeRequest::SyncKeys { link_id, rows, consumed: batch.consumed() },
                required: true,
            });
            keys.extend(batch.issued.into_iter().map(|k| (k.key_id, k.material)));
        }

        tracing::debug!(%ksid, keys = keys.len(), size_bits, "direct keys issued");
        step.reply = Reply::Ready(KmeResponse::Keys(containers(&keys)));
        Ok(step)
    }

    fn relay_first(
        &self,
        record: &SessionRecord,
        next: KmeId,
        number: usize,
        size_bits: u32,
    ) -> Result<Step, QkdError> {
        let ksid = record.ksid;
        let link_id = self.link_to(next)?;

        let mut keys = self.prefetched(ksid, number, size_bits)?;
        let app_batch = self.top_up(ksid, link_id, number - keys.len(), size_bits)?;

        let otks = match self.keys.generate(Generation {
            ksid,
            link_id,
            size_bits,
            count: number,
            keep_local: 0,
        }) {
            Ok(otks) => otks,
            Err(err) => {
                if let Some(batch) = &app_batch
                    && let Err(undo) = self.keys.undo_batch(ksid, batch)
                {
                    tracing::error!(%ksid, error = %undo, "failed to undo application keys");
                }
                return Err(err);
            },
        };

        let mut consumed = Vec::new();
        let mut step = Step::ack();
        if let Some(batch) = app_batch {
            consumed.extend(batch.consumed());
            step.discard_on_failure = batch.stored_ids().into_iter().map(|id| (ksid, id)).collect();
            keys.extend(batch.issued.into_iter().map(|k| (k.key_id, k.material)));
        }
        consumed.extend(otks.consumed());

        let rows = otks.rows(ksid, true, self.env.wall_clock_secs());
        step.actions.push(KmeAction::CallKme {
            kme: next,
            request: KmeRequest::SyncKeys { link_id, rows, consumed },
            required: true,
        });

        for ((key_id, key), otk) in keys.iter().zip(&otks.issued) {
            step.actions.push(KmeAction::CallKme {
                kme: next,
                request: KmeRequest::RelayForward {
                    ksid,
                    key_id: *key_id,
                    otk_id: otk.key_id,
                    cipher: relay::wrap(key, &otk.material)?,
                    size: size_bits,
                },
                required: true,
            });
        }

        tracing::debug!(%ksid, keys = keys.len(), %next, "relay keys issued");
        step.reply = Reply::Ready(KmeResponse::Keys(containers(&keys)));
        Ok(step)
    }

    /// Both applications on this KME: carve from the lowest-id confirmed
    /// link that can cover the request and keep a copy for the slave.
    fn local_keys(
        &self,
        record: &SessionRecord,
        number: usize,
        size_bits: u32,
    ) -> Result<Step, QkdError> {
        let ksid = record.ksid;
        let needed = number * (size_bits / 8) as usize;

        let mut confirmed: Vec<(LinkId, KmeId)> = self
            .links
            .values()
            .filter_map(|s| s.record.companion.map(|c| (s.record.link_id, c)))
            .collect();
        confirmed.sort();

        let mut chosen = None;
        let mut best = None;
        for (link_id, companion) in &confirmed {
            let available = self.keys.available(*link_id)?;
            if available >= needed {
                chosen = Some((*link_id, *companion));
                break;
            }
            if best.is_none_or(|(_, most)| available > most) {
                best = Some((*link_id, available));
            }
        }
        let Some((link_id, companion)) = chosen else {
            return Err(match best {
                Some((link_id, available)) => {
                    QkdError::BlockNotFound { link_id, requested: needed, available }
                },
                None => QkdError::InvalidRequest("kme has no confirmed link".to_string()),
            });
        };

        let batch = self.keys.generate(Generation {
            ksid,
            link_id,
            size_bits,
            count: number,
            keep_local: number,
        })?;

        let keys: Vec<(KeyId, KeyMaterial)> =
            batch.stored.iter().map(|k| (k.key_id, k.material.clone())).collect();
        let step = Step {
            reply: Reply::Ready(KmeResponse::Keys(containers(&keys))),
            actions: vec![KmeAction::CallKme {
                kme: companion,
                request: KmeRequest::SyncKeys {
                    link_id,
                    rows: Vec::new(),
                    consumed: batch.consumed(),
                },
                required: true,
            }],
            discard_on_failure: batch.stored_ids().into_iter().map(|id| (ksid, id)).collect(),
        };

        tracing::debug!(%ksid, keys = keys.len(), %link_id, "local keys issued");
        Ok(step)
    }

    fn dec_keys(&self, src: AppId, dst: AppId, key_ids: &[KeyId]) -> Result<Step, QkdError> {
        let record = self.session_by_apps(src, dst)?;
        if record.kme_dst != self.id {
            return Err(QkdError::InvalidRequest(format!(
                "slave of {} is attached to kme {}",
                record.ksid, record.kme_dst
            )));
        }
        self.check_count(key_ids.len())?;

        let ksid = record.ksid;
        let replay = match RelayState::resolve(&record, self.id)? {
            RelayState::Direct { companion: Some(_) } => true,
            RelayState::Direct { companion: None } | RelayState::Last { .. } => false,
            state => {
                return Err(QkdError::ProtocolViolation(format!(
                    "dec_keys on {ksid} at non-last hop {state:?}"
                )));
            },
        };

        let materials = self.keys.retrieve(ksid, key_ids, replay)?;
        let keys: Vec<(KeyId, KeyMaterial)> =
            key_ids.iter().copied().zip(materials).collect();

        tracing::debug!(%ksid, keys = keys.len(), "keys retrieved");
        Ok(Step::reply(KmeResponse::Keys(containers(&keys))))
    }

    fn status(&self, src: AppId, dst: AppId) -> Result<Step, QkdError> {
        let record = self.session_by_apps(src, dst)?;
        let report = StatusReport {
            ksid: record.ksid,
            src,
            dst,
            key_size: self.config.default_key_size,
            stored_key_count: self.keys.session_key_count(record.ksid)?,
            max_key_count: self.config.max_key_count,
            max_key_per_request: self.config.max_keys_per_request,
            max_key_size: self.config.max_key_size,
            min_key_size: self.config.min_key_size,
            max_sae_id_count: self.config.max_sae_id_count,
        };
        Ok(Step::reply(KmeResponse::Status(report)))
    }

    fn close_session(&mut self, ksid: Ksid, from: Option<KmeId>) -> Result<Step, QkdError> {
        let record =
            self.sessions.remove(ksid).ok_or(QkdError::SessionNotFound(SessionRef::Ksid(ksid)))?;
        self.keys.storage().delete_session(ksid)?;
        self.keys.purge_session(ksid)?;

        let mut step = Step::ack();
        if record.kme_src == self.id {
            step.actions.push(KmeAction::CallController {
                request: ControllerRequest::CloseConnection { ksid },
                required: false,
            });
        }
        if let Ok(state) = RelayState::resolve(&record, self.id) {
            for neighbour in state.neighbours() {
                if Some(neighbour) != from {
                    step.actions.push(KmeAction::CallKme {
                        kme: neighbour,
                        request: KmeRequest::CloseSession { ksid, from: Some(self.id) },
                        required: false,
                    });
                }
            }
        }

        tracing::info!(kme = %self.id, %ksid, ?from, "session closed");
        Ok(step)
    }

    fn relay_forward(
        &self,
        ksid: Ksid,
        key_id: KeyId,
        otk_id: KeyId,
        cipher: &str,
        size_bits: u32,
    ) -> Result<Step, QkdError> {
        let record = self
            .sessions
            .get(ksid)
            .cloned()
            .ok_or(QkdError::SessionNotFound(SessionRef::Ksid(ksid)))?;
        let state = RelayState::resolve(&record, self.id)?;
        if !matches!(state, RelayState::Middle { .. } | RelayState::Last { .. }) {
            return Err(QkdError::ProtocolViolation(format!(
                "relay forward for {ksid} at {state:?}"
            )));
        }

        let otk = self.keys.reconstruct(ksid, otk_id)?;
        let key = relay::unwrap(cipher, &otk, size_bits).inspect_err(|err| {
            tracing::error!(%ksid, %key_id, error = %err, "relay unwrap failed");
        })?;

        match state {
            RelayState::Middle { next, .. } => {
                let link_id = self.link_to(next)?;
                let batch = self.keys.generate(Generation {
                    ksid,
                    link_id,
                    size_bits,
                    count: 1,
                    keep_local: 0,
                })?;
                let fresh = batch.issued.first().ok_or_else(|| {
                    QkdError::ProtocolViolation("empty one-time key batch".to_string())
                })?;
                let forward = KmeRequest::RelayForward {
                    ksid,
                    key_id,
                    otk_id: fresh.key_id,
                    cipher: relay::wrap(&key, &fresh.material)?,
                    size: size_bits,
                };
                let rows: Vec<KeyRow> = batch.rows(ksid, true, self.env.wall_clock_secs());

                tracing::debug!(%ksid, %key_id, hop = %self.id, %next, "relayed key");
                Ok(Step::ack()
                    .then(KmeAction::CallKme {
                        kme: next,
                        request: KmeRequest::SyncKeys { link_id, rows, consumed: batch.consumed() },
                        required: true,
                    })
                    .then(KmeAction::CallKme { kme: next, request: forward, required: true }))
            },
            _ => {
                self.keys.store_local(ksid, vec![(key_id, key)])?;
                tracing::debug!(%ksid, %key_id, "relayed key delivered");
                Ok(Step::ack())
            },
        }
    }
}

fn containers(keys: &[(KeyId, KeyMaterial)]) -> Vec<KeyContainer> {
    keys.iter().map(|(key_id, key)| KeyContainer { key_id: *key_id, key: key.encode() }).collect()
}
