//! Connection Directory.
//!
//! Matches the two sides of an application pair into one session. A side
//! that registers first waits as a pending request; the other side matches
//! it if the pair and the QoS are identical. Pending requests older than
//! the TTL are purged on the next registration, before matching.
//!
//! Open sessions are indexed by Ksid and by application pair, and carry the
//! capacity reservation that must be released when they close.

use std::{collections::HashMap, ops::Sub, time::Duration};

use qkdnet_core::{AppId, KmeId, Ksid, Qos, SessionIndex, SessionRecord};

use crate::graph::Reservation;

/// One side's registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppRequest {
    /// Master application.
    pub src: AppId,
    /// Slave application.
    pub dst: AppId,
    /// KME the registering side is attached to.
    pub kme: KmeId,
    /// Requested QoS.
    pub qos: Qos,
    /// True for the master side.
    pub master: bool,
}

/// Outcome of [`ConnectionDirectory::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matched {
    /// Stored; waiting for the other side.
    Pending,
    /// Both sides present. The counterpart has left the pending set.
    Pair {
        /// Master side.
        master: AppRequest,
        /// Slave side.
        slave: AppRequest,
    },
}

#[derive(Debug, Clone, Copy)]
struct Pending<I> {
    request: AppRequest,
    at: I,
}

/// Pending registrations and open sessions.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug)]
pub struct ConnectionDirectory<I> {
    pending_ttl: Duration,
    pending: HashMap<(AppId, AppId, bool), Pending<I>>,
    sessions: SessionIndex,
    reservations: HashMap<Ksid, Reservation>,
}

impl<I> ConnectionDirectory<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Empty directory.
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            pending_ttl,
            pending: HashMap::new(),
            sessions: SessionIndex::new(),
            reservations: HashMap::new(),
        }
    }

    /// Matches `request` against the other side, or stores it.
    ///
    /// A side registering again replaces its own pending entry.
    pub fn register(&mut self, request: AppRequest, now: I) -> Matched {
        self.purge_expired(now);

        let other = (request.src, request.dst, !request.master);
        match self.pending.get(&other) {
            Some(pending) if pending.request.qos == request.qos => {
                let counterpart = pending.request;
                self.pending.remove(&other);
                let (master, slave) =
                    if request.master { (request, counterpart) } else { (counterpart, request) };
                Matched::Pair { master, slave }
            },
            _ => {
                self.requeue(request, now);
                Matched::Pending
            },
        }
    }

    /// Puts a request back in the pending set, timestamped `at`.
    pub fn requeue(&mut self, request: AppRequest, at: I) {
        self.pending.insert((request.src, request.dst, request.master), Pending { request, at });
    }

    /// Drops pending requests older than the TTL. Returns how many.
    pub fn purge_expired(&mut self, now: I) -> usize {
        let ttl = self.pending_ttl;
        let before = self.pending.len();
        self.pending.retain(|_, pending| now - pending.at < ttl);

        let purged = before - self.pending.len();
        if purged > 0 {
            tracing::debug!(purged, "expired registrations purged");
        }
        purged
    }

    /// Number of requests waiting for their counterpart.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Records an admitted session with its reservation.
    pub fn open(&mut self, record: SessionRecord, reservation: Reservation) {
        self.reservations.insert(record.ksid, reservation);
        self.sessions.insert(record);
    }

    /// Removes a session. Returns its record and the reservation to
    /// release.
    pub fn close(&mut self, ksid: Ksid) -> Option<(SessionRecord, Reservation)> {
        let record = self.sessions.remove(ksid)?;
        let reservation = self.reservations.remove(&ksid).unwrap_or_else(|| Reservation {
            path: record.path.clone(),
            demand: Vec::new(),
        });
        Some((record, reservation))
    }

    /// Session by Ksid.
    pub fn get(&self, ksid: Ksid) -> Option<&SessionRecord> {
        self.sessions.get(ksid)
    }

    /// Session by application pair.
    pub fn by_apps(&self, src: AppId, dst: AppId) -> Option<&SessionRecord> {
        self.sessions.by_apps(src, dst)
    }

    /// Reservation held by an open session.
    pub fn reservation(&self, ksid: Ksid) -> Option<&Reservation> {
        self.reservations.get(&ksid)
    }

    /// Open sessions.
    pub fn sessions(&self) -> &SessionIndex {
        &self.sessions
    }
}
