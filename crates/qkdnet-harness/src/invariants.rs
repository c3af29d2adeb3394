//! Invariant checking over a whole simulated network.
//!
//! A [`NetworkSnapshot`] captures the controller's edges and sessions and
//! every KME's view of the sessions it is on. Registered [`Invariant`]s
//! then check properties that must hold between requests, whatever the
//! sequence of operations that led there.

use std::collections::HashMap;

use qkdnet_controller::Reservation;
use qkdnet_core::{KmeId, Ksid, SessionRecord};
use qkdnet_kme::RelayState;

/// Tolerance for floating-point rate sums.
const RATE_EPS: f64 = 1e-6;

/// One controller edge.
#[derive(Debug, Clone)]
pub struct EdgeSnapshot {
    /// End points, lower id first.
    pub ends: (KmeId, KmeId),
    /// Capacity estimate at snapshot time (bits/s).
    pub capacity: f64,
    /// Reserved rate (bits/s).
    pub reserved: f64,
}

/// One session as a KME holds it.
#[derive(Debug, Clone)]
pub struct KmeSession {
    /// The KME's copy of the record.
    pub record: SessionRecord,
    /// Key rows and local keys it holds for the session.
    pub stored_keys: usize,
}

/// One KME.
#[derive(Debug, Clone)]
pub struct KmeSnapshot {
    /// KME identifier.
    pub id: KmeId,
    /// Sessions it is on.
    pub sessions: Vec<KmeSession>,
}

/// Observable state of the network between requests.
#[derive(Debug, Clone, Default)]
pub struct NetworkSnapshot {
    /// Controller edges.
    pub edges: Vec<EdgeSnapshot>,
    /// Controller sessions with their reservations.
    pub sessions: Vec<(SessionRecord, Reservation)>,
    /// Every KME.
    pub kmes: Vec<KmeSnapshot>,
}

impl NetworkSnapshot {
    fn kme(&self, id: KmeId) -> Option<&KmeSnapshot> {
        self.kmes.iter().find(|kme| kme.id == id)
    }
}

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against a snapshot.
pub trait Invariant: Send + Sync {
    /// Name for error reporting.
    fn name(&self) -> &'static str;

    /// Checks the snapshot.
    fn check(&self, state: &NetworkSnapshot) -> InvariantResult;
}

/// Each edge's reserved rate is exactly what the open sessions crossing it
/// demand.
pub struct ReservationsBalanced;

impl Invariant for ReservationsBalanced {
    fn name(&self) -> &'static str {
        "reservations_balanced"
    }

    fn check(&self, state: &NetworkSnapshot) -> InvariantResult {
        let mut demanded: HashMap<(KmeId, KmeId), f64> = HashMap::new();
        for (_, reservation) in &state.sessions {
            for ((a, b), rate) in reservation.edges().zip(&reservation.demand) {
                let ends = if a <= b { (a, b) } else { (b, a) };
                *demanded.entry(ends).or_default() += rate;
            }
        }

        for edge in &state.edges {
            let expected = demanded.get(&edge.ends).copied().unwrap_or(0.0);
            if edge.reserved < -RATE_EPS || (edge.reserved - expected).abs() > RATE_EPS {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "edge {}-{} reserves {} but its sessions demand {expected}",
                        edge.ends.0, edge.ends.1, edge.reserved
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Every KME on an open session's path holds the controller's record.
pub struct PathsAgree;

impl Invariant for PathsAgree {
    fn name(&self) -> &'static str {
        "paths_agree"
    }

    fn check(&self, state: &NetworkSnapshot) -> InvariantResult {
        for (record, _) in &state.sessions {
            for hop in &record.path {
                let ksid = record.ksid;
                let held = state
                    .kme(*hop)
                    .and_then(|kme| kme.sessions.iter().find(|s| s.record.ksid == ksid));
                let message = match held {
                    Some(session) if session.record == *record => continue,
                    Some(_) => format!("kme {hop} holds a different record of {ksid}"),
                    None => format!("kme {hop} is on {ksid} but never heard of it"),
                };
                return Err(Violation { invariant: self.name(), message });
            }
        }
        Ok(())
    }
}

/// No KME keeps a session the controller has closed.
pub struct NoOrphanSessions;

impl Invariant for NoOrphanSessions {
    fn name(&self) -> &'static str {
        "no_orphan_sessions"
    }

    fn check(&self, state: &NetworkSnapshot) -> InvariantResult {
        let open: Vec<Ksid> = state.sessions.iter().map(|(record, _)| record.ksid).collect();
        for kme in &state.kmes {
            if let Some(orphan) = kme.sessions.iter().find(|s| !open.contains(&s.record.ksid)) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("kme {} still holds closed {}", kme.id, orphan.record.ksid),
                });
            }
        }
        Ok(())
    }
}

/// Intermediate hops hold nothing for a session once a request is done.
pub struct RelayHopsHoldNoKeys;

impl Invariant for RelayHopsHoldNoKeys {
    fn name(&self) -> &'static str {
        "relay_hops_hold_no_keys"
    }

    fn check(&self, state: &NetworkSnapshot) -> InvariantResult {
        for kme in &state.kmes {
            for session in &kme.sessions {
                let middle = matches!(
                    RelayState::resolve(&session.record, kme.id),
                    Ok(RelayState::Middle { .. })
                );
                if middle && session.stored_keys > 0 {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "relay hop {} holds {} keys of {}",
                            kme.id, session.stored_keys, session.record.ksid
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Invariants to check together.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Every invariant that holds on a network without failures.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(ReservationsBalanced);
        registry.add(PathsAgree);
        registry.add(NoOrphanSessions);
        registry.add(RelayHopsHoldNoKeys);
        registry
    }

    /// Adds an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Checks every invariant.
    ///
    /// # Errors
    ///
    /// Every violation found.
    pub fn check_all(&self, state: &NetworkSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use qkdnet_core::{AppId, Qos};

    use super::*;

    fn record(ksid: u128, path: &[u128]) -> SessionRecord {
        let path: Vec<KmeId> = path.iter().map(|k| KmeId(*k)).collect();
        SessionRecord {
            ksid: Ksid(ksid),
            src: AppId(1),
            dst: AppId(2),
            kme_src: path[0],
            kme_dst: path[path.len() - 1],
            qos: Qos { key_chunk_size: 256, request_interval_ms: 1000 },
            path,
            created_at: 0,
        }
    }

    #[test]
    fn standard_registry_has_invariants() {
        assert_eq!(InvariantRegistry::standard().len(), 4);
    }

    #[test]
    fn unbalanced_edge_is_reported() {
        let state = NetworkSnapshot {
            edges: vec![EdgeSnapshot { ends: (KmeId(1), KmeId(2)), capacity: 10.0, reserved: 4.0 }],
            sessions: Vec::new(),
            kmes: Vec::new(),
        };

        let violation = ReservationsBalanced.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "reservations_balanced");
    }

    #[test]
    fn missing_hop_is_reported() {
        let session = record(7, &[1, 2]);
        let reservation = Reservation { path: session.path.clone(), demand: vec![1.0] };
        let state = NetworkSnapshot {
            edges: vec![EdgeSnapshot { ends: (KmeId(1), KmeId(2)), capacity: 10.0, reserved: 1.0 }],
            sessions: vec![(session.clone(), reservation)],
            kmes: vec![KmeSnapshot {
                id: KmeId(1),
                sessions: vec![KmeSession { record: session, stored_keys: 0 }],
            }],
        };

        assert!(ReservationsBalanced.check(&state).is_ok());
        assert!(PathsAgree.check(&state).is_err());
    }

    #[test]
    fn middle_hop_with_keys_is_reported() {
        let session = record(7, &[1, 2, 3]);
        let state = NetworkSnapshot {
            kmes: vec![KmeSnapshot {
                id: KmeId(2),
                sessions: vec![KmeSession { record: session, stored_keys: 1 }],
            }],
            ..NetworkSnapshot::default()
        };

        assert!(RelayHopsHoldNoKeys.check(&state).is_err());
        assert!(NoOrphanSessions.check(&state).is_err());
    }
}
