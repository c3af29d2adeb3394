//! End-to-end sessions (Ksids) and their lookup index.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{AppId, KmeId, Ksid};

/// Quality of service requested by an application pair.
///
/// Two registrations match only if their QoS is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qos {
    /// Bits per key request.
    pub key_chunk_size: u32,
    /// Milliseconds between requests.
    pub request_interval_ms: u64,
}

impl Qos {
    /// Requested rate in bits per second.
    pub fn rate(&self) -> f64 {
        f64::from(self.key_chunk_size) * 1000.0 / self.request_interval_ms.max(1) as f64
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Registration {
    /// Both sides matched and a path was reserved.
    Registered(Ksid),
    /// Waiting for the other side to register.
    Pending,
}

/// One end-to-end connection as every KME on its path sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier.
    pub ksid: Ksid,
    /// Master application, the one that requests keys.
    pub src: AppId,
    /// Slave application, the one that retrieves them.
    pub dst: AppId,
    /// KME hosting `src`.
    pub kme_src: KmeId,
    /// KME hosting `dst`.
    pub kme_dst: KmeId,
    /// Requested QoS.
    pub qos: Qos,
    /// KMEs from `kme_src` to `kme_dst`, both included.
    pub path: Vec<KmeId>,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
}

impl SessionRecord {
    /// True if keys must be relayed through intermediate KMEs.
    pub fn relay(&self) -> bool {
        self.path.len() > 2
    }

    /// Index of `kme` on the path.
    pub fn position(&self, kme: KmeId) -> Option<usize> {
        self.path.iter().position(|k| *k == kme)
    }

    /// Hop before `kme`, towards the master.
    pub fn previous_hop(&self, kme: KmeId) -> Option<KmeId> {
        let pos = self.position(kme)?;
        pos.checked_sub(1).and_then(|i| self.path.get(i)).copied()
    }

    /// Hop after `kme`, towards the slave.
    pub fn next_hop(&self, kme: KmeId) -> Option<KmeId> {
        let pos = self.position(kme)?;
        self.path.get(pos + 1).copied()
    }
}

/// Sessions indexed by Ksid and by (src, dst) application pair.
///
/// Both lookups are O(1). When a pair is re-registered the pair index
/// follows the newest session; the older one stays reachable by Ksid until
/// removed.
#[derive(Debug, Default)]
pub struct SessionIndex {
    by_ksid: HashMap<Ksid, SessionRecord>,
    by_apps: HashMap<(AppId, AppId), Ksid>,
}

impl SessionIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a session. Returns the previous record under the
    /// same Ksid.
    pub fn insert(&mut self, record: SessionRecord) -> Option<SessionRecord> {
        self.by_apps.insert((record.src, record.dst), record.ksid);
        self.by_ksid.insert(record.ksid, record)
    }

    /// Removes a session and its pair entry.
    pub fn remove(&mut self, ksid: Ksid) -> Option<SessionRecord> {
        let record = self.by_ksid.remove(&ksid)?;
        if self.by_apps.get(&(record.src, record.dst)) == Some(&ksid) {
            self.by_apps.remove(&(record.src, record.dst));
        }
        Some(record)
    }

    /// Session by Ksid.
    pub fn get(&self, ksid: Ksid) -> Option<&SessionRecord> {
        self.by_ksid.get(&ksid)
    }

    /// Session by application pair.
    pub fn by_apps(&self, src: AppId, dst: AppId) -> Option<&SessionRecord> {
        self.by_apps.get(&(src, dst)).and_then(|ksid| self.by_ksid.get(ksid))
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.by_ksid.len()
    }

    /// True if no sessions are indexed.
    pub fn is_empty(&self) -> bool {
        self.by_ksid.is_empty()
    }

    /// All sessions, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
        self.by_ksid.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ksid: u128, src: u128, dst: u128, path: &[u128]) -> SessionRecord {
        SessionRecord {
            ksid: Ksid(ksid),
            src: AppId(src),
            dst: AppId(dst),
            kme_src: KmeId(path[0]),
            kme_dst: KmeId(path[path.len() - 1]),
            qos: Qos { key_chunk_size: 256, request_interval_ms: 1000 },
            path: path.iter().copied().map(KmeId).collect(),
            created_at: 0,
        }
    }

    #[test]
    fn hops_along_path() {
        let r = record(1, 10, 20, &[1, 2, 3]);

        assert!(r.relay());
        assert_eq!(r.previous_hop(KmeId(1)), None);
        assert_eq!(r.next_hop(KmeId(1)), Some(KmeId(2)));
        assert_eq!(r.previous_hop(KmeId(3)), Some(KmeId(2)));
        assert_eq!(r.next_hop(KmeId(3)), None);
        assert_eq!(r.next_hop(KmeId(9)), None);
    }

    #[test]
    fn adjacent_kmes_do_not_relay() {
        assert!(!record(1, 10, 20, &[1, 2]).relay());
        assert!(!record(1, 10, 20, &[1]).relay());
    }

    #[test]
    fn index_by_both_shapes() {
        let mut index = SessionIndex::new();
        index.insert(record(1, 10, 20, &[1, 2]));

        assert_eq!(index.get(Ksid(1)).map(|r| r.src), Some(AppId(10)));
        assert_eq!(index.by_apps(AppId(10), AppId(20)).map(|r| r.ksid), Some(Ksid(1)));
        assert!(index.by_apps(AppId(20), AppId(10)).is_none());

        index.remove(Ksid(1));
        assert!(index.is_empty());
        assert!(index.by_apps(AppId(10), AppId(20)).is_none());
    }

    #[test]
    fn removing_stale_session_keeps_newer_pair_entry() {
        let mut index = SessionIndex::new();
        index.insert(record(1, 10, 20, &[1, 2]));
        index.insert(record(2, 10, 20, &[1, 2]));

        index.remove(Ksid(1));
        assert_eq!(index.by_apps(AppId(10), AppId(20)).map(|r| r.ksid), Some(Ksid(2)));
    }

    #[test]
    fn qos_rate_in_bits_per_second() {
        let qos = Qos { key_chunk_size: 256, request_interval_ms: 500 };
        assert!((qos.rate() - 512.0).abs() < f64::EPSILON);
    }
}
