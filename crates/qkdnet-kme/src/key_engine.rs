//! Key Material Engine.
//!
//! Turns block allocations into keys. The generating KME carves, reads the
//! bytes, drops its own references and hands the instructions to the
//! companion KME, which keeps a reference per range until it replays them.
//! The companion never sees key bytes on the wire: it derives the same key
//! from its own copy of the blocks.
//!
//! A generation batch is all-or-nothing. If any key in the batch cannot be
//! carved, or if persisting the locally kept keys fails, every carve of the
//! batch is rolled back.

use std::{collections::HashSet, time::Duration};

use qkdnet_core::{
    Environment, Instruction, KeyId, KeyMaterial, Ksid, LinkId, QkdError,
    message::KeyRow,
};

use crate::{
    block_store::BlockStore,
    storage::{LocalKey, Storage},
};

/// Parameters of one generation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    /// Session the keys belong to.
    pub ksid: Ksid,
    /// Link whose pool backs the keys.
    pub link_id: LinkId,
    /// Size of every key in the batch (bits, whole bytes).
    pub size_bits: u32,
    /// Keys to generate, kept ones included.
    pub count: usize,
    /// How many of them to keep locally in the clear.
    pub keep_local: usize,
}

/// One generated key.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// Key identifier.
    pub key_id: KeyId,
    /// Ranges the key was carved from, in order.
    pub instructions: Vec<Instruction>,
    /// Key bytes.
    pub material: KeyMaterial,
}

/// Result of [`KeyEngine::generate`].
#[derive(Debug)]
pub struct KeyBatch {
    /// Link the batch was carved from.
    pub link_id: LinkId,
    /// Keys for the caller.
    pub issued: Vec<GeneratedKey>,
    /// Keys persisted locally for later requests.
    pub stored: Vec<GeneratedKey>,
}

impl KeyBatch {
    /// Every range the batch consumed, in carve order.
    pub fn consumed(&self) -> Vec<Instruction> {
        self.issued
            .iter()
            .chain(&self.stored)
            .flat_map(|key| key.instructions.iter().copied())
            .collect()
    }

    /// Instruction rows for the companion, one per key.
    pub fn rows(&self, ksid: Ksid, relay: bool, created_at: u64) -> Vec<KeyRow> {
        self.issued
            .iter()
            .chain(&self.stored)
            .map(|key| KeyRow {
                key_id: key.key_id,
                ksid,
                link_id: self.link_id,
                instructions: key.instructions.clone(),
                relay,
                created_at,
            })
            .collect()
    }

    /// Identifiers of the locally stored keys.
    pub fn stored_ids(&self) -> Vec<KeyId> {
        self.stored.iter().map(|key| key.key_id).collect()
    }
}

/// Key Material Engine of one KME.
pub struct KeyEngine<E: Environment, S: Storage> {
    env: E,
    blocks: BlockStore<S>,
}

impl<E: Environment, S: Storage> KeyEngine<E, S> {
    /// Engine over a block pool with the given block lifetime.
    ///
    /// # Errors
    ///
    /// `Storage` if the pool cannot be opened.
    pub fn new(env: E, storage: S, ttl: Duration) -> Result<Self, QkdError> {
        Ok(Self { env, blocks: BlockStore::open(storage, ttl)? })
    }

    /// The underlying block pool.
    pub fn blocks(&self) -> &BlockStore<S> {
        &self.blocks
    }

    /// Mutable access to the pool, for ingest.
    pub fn blocks_mut(&mut self) -> &mut BlockStore<S> {
        &mut self.blocks
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        self.blocks.storage()
    }

    /// Generates a batch of equal-size keys on one link.
    ///
    /// The last `keep_local` keys are persisted as local keys of the
    /// session; the rest are returned only. This KME keeps no reference on
    /// the carved ranges.
    ///
    /// # Errors
    ///
    /// - `BlockNotFound` if the pool runs out part way; nothing is consumed.
    /// - `InvalidRequest` for a size that is zero or not whole bytes.
    /// - `Storage` on backend failure; nothing is consumed.
    pub fn generate(&self, generation: Generation) -> Result<KeyBatch, QkdError> {
        let Generation { ksid, link_id, size_bits, count, keep_local } = generation;
        if size_bits == 0 || size_bits % 8 != 0 {
            return Err(QkdError::InvalidRequest(format!("key size {size_bits} bits")));
        }
        let n_bytes = (size_bits / 8) as usize;
        let now = self.env.wall_clock_secs();

        let mut carved: Vec<Instruction> = Vec::new();
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let instructions = match self.blocks.reserve_range(link_id, n_bytes, now) {
                Ok(instructions) => instructions,
                Err(err) => {
                    self.rollback(&carved, true);
                    return Err(err);
                },
            };
            carved.extend_from_slice(&instructions);

            let material = match self.blocks.read(&instructions) {
                Ok(material) => material,
                Err(err) => {
                    self.rollback(&carved, true);
                    return Err(err);
                },
            };
            keys.push(GeneratedKey { key_id: KeyId::random(&self.env), instructions, material });
        }

        for (released, instruction) in carved.iter().enumerate() {
            if let Err(err) = self.blocks.release_range(std::slice::from_ref(instruction)) {
                // Newest first: the unreleased tail still holds its refs.
                self.rollback(&carved[released..], true);
                self.rollback(&carved[..released], false);
                return Err(err);
            }
        }

        let stored = keys.split_off(count.saturating_sub(keep_local));
        let local: Vec<LocalKey> = stored
            .iter()
            .map(|key| LocalKey {
                ksid,
                key_id: key.key_id,
                material: key.material.clone(),
                created_at: now,
            })
            .collect();
        if !local.is_empty()
            && let Err(err) = self.storage().store_local_keys(&local)
        {
            self.rollback(&carved, false);
            return Err(err.into());
        }

        tracing::debug!(
            %ksid,
            %link_id,
            issued = keys.len(),
            stored = stored.len(),
            bytes = n_bytes * count,
            "generated keys"
        );
        Ok(KeyBatch { link_id, issued: keys, stored })
    }

    /// Drops locally stored keys that were never handed out. Their ranges
    /// stay consumed.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn discard(&self, ksid: Ksid, key_ids: &[KeyId]) -> Result<(), QkdError> {
        for key_id in key_ids {
            self.storage().take_local_key(ksid, Some(*key_id))?;
        }
        Ok(())
    }

    /// Reverts a batch generated under the current lock: local copies are
    /// dropped and the carves are handed back to the pool.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn undo_batch(&self, ksid: Ksid, batch: &KeyBatch) -> Result<(), QkdError> {
        self.discard(ksid, &batch.stored_ids())?;
        self.blocks.undo(&batch.consumed(), false)
    }

    /// Replays the persisted instructions of a key, consuming the row and
    /// releasing its references.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if no row exists.
    /// - `BlockEvicted` if a backing block is gone. The row is dropped.
    /// - `Storage` on backend failure. The row is kept for a retry.
    pub fn reconstruct(&self, ksid: Ksid, key_id: KeyId) -> Result<KeyMaterial, QkdError> {
        let row = self
            .storage()
            .take_key_row(ksid, key_id)?
            .ok_or(QkdError::KeyNotFound { ksid, key_id })?;

        let material = match self.blocks.read(&row.instructions) {
            Ok(material) => material,
            Err(err) => {
                if err.is_fatal() {
                    tracing::error!(%ksid, %key_id, error = %err, "key cannot be replayed");
                    if let Err(release) = self.blocks.release_range(&row.instructions) {
                        tracing::error!(
                            %ksid,
                            %key_id,
                            error = %release,
                            "release after failed replay"
                        );
                    }
                } else if let Err(put_back) = self.storage().store_key_rows(&[row]) {
                    tracing::error!(%ksid, %key_id, error = %put_back, "lost key row");
                }
                return Err(err);
            },
        };

        self.blocks.release_range(&row.instructions)?;
        tracing::debug!(%ksid, %key_id, bytes = material.len(), "reconstructed key");
        Ok(material)
    }

    /// Applies a companion's sync: mirrors its consumption, then persists
    /// the rows this KME will replay.
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` if a row is for another link, has no
    ///   instructions, or uses a range not listed in `consumed`.
    /// - `BlockEvicted` if a row references a block not resident here.
    /// - `Storage` on backend failure. References taken for the rows are
    ///   released again.
    pub fn apply_sync(
        &self,
        link_id: LinkId,
        rows: &[KeyRow],
        consumed: &[Instruction],
    ) -> Result<(), QkdError> {
        let consumed_set: HashSet<Instruction> = consumed.iter().copied().collect();
        let mut retained = HashSet::new();
        let mut row_ranges = Vec::new();
        for row in rows {
            if row.link_id != link_id {
                return Err(QkdError::ProtocolViolation(format!(
                    "key {} synced on link {link_id} but belongs to {}",
                    row.key_id, row.link_id
                )));
            }
            if row.instructions.is_empty() {
                return Err(QkdError::ProtocolViolation(format!(
                    "key {} has no instructions",
                    row.key_id
                )));
            }
            for instruction in &row.instructions {
                if !consumed_set.contains(instruction) {
                    return Err(QkdError::ProtocolViolation(format!(
                        "key {} uses a range the companion did not consume",
                        row.key_id
                    )));
                }
                retained.insert(*instruction);
                row_ranges.push(*instruction);
            }
        }

        self.blocks.acknowledge(link_id, consumed, &retained)?;

        if let Err(err) = self.storage().store_key_rows(rows) {
            if let Err(release) = self.blocks.release_range(&row_ranges) {
                tracing::error!(%link_id, error = %release, "release after failed sync");
            }
            return Err(err.into());
        }

        tracing::debug!(%link_id, rows = rows.len(), ranges = consumed.len(), "applied sync");
        Ok(())
    }

    /// Pops the oldest prefetched key of a session if it has the requested
    /// size. A key of another size stays stored: the companion holds its row
    /// until the key is handed out.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn take_prefetched(
        &self,
        ksid: Ksid,
        size_bits: u32,
    ) -> Result<Option<LocalKey>, QkdError> {
        let Some(key) = self.storage().take_local_key(ksid, None)? else {
            return Ok(None);
        };
        if key.material.bit_len() == size_bits as usize {
            return Ok(Some(key));
        }

        self.storage().store_local_keys(std::slice::from_ref(&key))?;
        tracing::debug!(%ksid, size_bits, have = key.material.bit_len(), "prefetch size differs");
        Ok(None)
    }

    /// Stores keys in the clear for local retrieval.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn store_local(&self, ksid: Ksid, keys: Vec<(KeyId, KeyMaterial)>) -> Result<(), QkdError> {
        let created_at = self.env.wall_clock_secs();
        let local: Vec<LocalKey> = keys
            .into_iter()
            .map(|(key_id, material)| LocalKey { ksid, key_id, material, created_at })
            .collect();
        self.storage().store_local_keys(&local)?;
        Ok(())
    }

    /// Hands a set of keys to the slave application: replayed from
    /// instruction rows if `replay`, otherwise popped from the local store.
    ///
    /// All or nothing. If any key is missing, unreadable or named twice,
    /// every key of the request stays retrievable. The one exception is a
    /// key whose blocks are gone, whose row is dropped as in
    /// [`Self::reconstruct`].
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if a key id repeats.
    /// - `KeyNotFound` for the first id the session does not hold.
    /// - `BlockEvicted` if a backing block is gone.
    /// - `Storage` on backend failure.
    pub fn retrieve(
        &self,
        ksid: Ksid,
        key_ids: &[KeyId],
        replay: bool,
    ) -> Result<Vec<KeyMaterial>, QkdError> {
        let mut seen = HashSet::new();
        if let Some(repeated) = key_ids.iter().find(|key_id| !seen.insert(**key_id)) {
            return Err(QkdError::InvalidRequest(format!("key {repeated} requested twice")));
        }

        if replay { self.replay_rows(ksid, key_ids) } else { self.take_locals(ksid, key_ids) }
    }

    fn replay_rows(&self, ksid: Ksid, key_ids: &[KeyId]) -> Result<Vec<KeyMaterial>, QkdError> {
        let mut rows: Vec<KeyRow> = Vec::with_capacity(key_ids.len());
        for key_id in key_ids {
            let taken = self
                .storage()
                .take_key_row(ksid, *key_id)
                .map_err(QkdError::from)
                .and_then(|row| row.ok_or(QkdError::KeyNotFound { ksid, key_id: *key_id }));
            match taken {
                Ok(row) => rows.push(row),
                Err(err) => {
                    self.restore_rows(ksid, &rows);
                    return Err(err);
                },
            }
        }

        let mut keys = Vec::with_capacity(rows.len());
        let mut failed = None;
        for (index, row) in rows.iter().enumerate() {
            match self.blocks.read(&row.instructions) {
                Ok(material) => keys.push(material),
                Err(err) => {
                    failed = Some((index, err));
                    break;
                },
            }
        }
        if let Some((index, err)) = failed {
            if err.is_fatal() {
                let lost = rows.remove(index);
                let key_id = lost.key_id;
                tracing::error!(%ksid, %key_id, error = %err, "key cannot be replayed");
                if let Err(release) = self.blocks.release_range(&lost.instructions) {
                    tracing::error!(%ksid, error = %release, "release after failed replay");
                }
            }
            self.restore_rows(ksid, &rows);
            return Err(err);
        }

        let ranges: Vec<Instruction> =
            rows.iter().flat_map(|row| row.instructions.iter().copied()).collect();
        self.blocks.release_range(&ranges)?;
        tracing::debug!(%ksid, keys = keys.len(), "reconstructed keys");
        Ok(keys)
    }

    fn take_locals(&self, ksid: Ksid, key_ids: &[KeyId]) -> Result<Vec<KeyMaterial>, QkdError> {
        let mut taken: Vec<LocalKey> = Vec::with_capacity(key_ids.len());
        for key_id in key_ids {
            let result = self
                .storage()
                .take_local_key(ksid, Some(*key_id))
                .map_err(QkdError::from)
                .and_then(|key| key.ok_or(QkdError::KeyNotFound { ksid, key_id: *key_id }));
            match result {
                Ok(key) => taken.push(key),
                Err(err) => {
                    if !taken.is_empty()
                        && let Err(put_back) = self.storage().store_local_keys(&taken)
                    {
                        tracing::error!(%ksid, error = %put_back, "lost local keys");
                    }
                    return Err(err);
                },
            }
        }
        Ok(taken.into_iter().map(|key| key.material).collect())
    }

    /// Puts taken rows back. Their block references were never released.
    fn restore_rows(&self, ksid: Ksid, rows: &[KeyRow]) {
        if rows.is_empty() {
            return;
        }
        if let Err(err) = self.storage().store_key_rows(rows) {
            tracing::error!(%ksid, rows = rows.len(), error = %err, "lost key rows");
        }
    }

    /// Forgets everything held for a session: local keys are dropped and
    /// pending rows release their references.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn purge_session(&self, ksid: Ksid) -> Result<(), QkdError> {
        let local = self.storage().purge_local_keys(ksid)?;
        let rows = self.storage().take_session_rows(ksid)?;
        let ranges: Vec<Instruction> =
            rows.iter().flat_map(|row| row.instructions.iter().copied()).collect();
        self.blocks.release_range(&ranges)?;

        tracing::debug!(%ksid, local, rows = rows.len(), "purged session keys");
        Ok(())
    }

    /// Keys currently held for a session.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn session_key_count(&self, ksid: Ksid) -> Result<usize, QkdError> {
        Ok(self.storage().count_session_keys(ksid)?)
    }

    /// Evicts dead blocks.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn sweep(&self) -> Result<usize, QkdError> {
        self.blocks.sweep(self.env.wall_clock_secs())
    }

    /// Bytes available for allocation on a link.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub fn available(&self, link_id: LinkId) -> Result<usize, QkdError> {
        self.blocks.available(link_id, self.env.wall_clock_secs())
    }

    fn rollback(&self, carved: &[Instruction], release_ref: bool) {
        if let Err(err) = self.blocks.undo(carved, release_ref) {
            tracing::error!(error = %err, carves = carved.len(), "batch rollback failed");
        }
    }
}
