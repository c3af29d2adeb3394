//! Capacity graph and admission control.
//!
//! Nodes are KMEs, edges are confirmed quantum links. Each edge carries a
//! [`CapacityWindow`] of the rates its KMEs report and the rate currently
//! reserved by sessions routed over it. Admission is all-or-nothing: a
//! [`Reservation`] is only produced if every edge on the path has headroom,
//! and it is released with exactly the amounts it reserved.
//!
//! Paths come from an all-pairs BFS table. With expected node and link
//! counts configured the table is built once, when the topology reaches
//! them; without, it is rebuilt on every topology change.
//!
//! Generic over `I` (Instant type) to support virtual time in tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    ops::Sub,
    time::Duration,
};

use qkdnet_core::{CapacityWindow, KmeId, LinkId, QkdError, RejectReason};

/// Rate taken from each edge of a path by one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// KMEs from source to destination.
    pub path: Vec<KmeId>,
    /// Rate per edge; entry `i` is the edge `path[i]`-`path[i + 1]`.
    pub demand: Vec<f64>,
}

impl Reservation {
    /// Edges of the path as node pairs.
    pub fn edges(&self) -> impl Iterator<Item = (KmeId, KmeId)> + '_ {
        self.path.windows(2).map(|pair| (pair[0], pair[1]))
    }
}

/// One confirmed link.
#[derive(Debug, Clone)]
pub struct Edge<I> {
    /// Link identifier.
    pub link_id: LinkId,
    window: CapacityWindow<I>,
    reserved: f64,
}

impl<I> Edge<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Capacity estimate at `now` (bits/s).
    pub fn capacity(&self, now: I) -> f64 {
        self.window.estimate(now)
    }

    /// Rate reserved by open sessions (bits/s).
    pub fn reserved(&self) -> f64 {
        self.reserved
    }

    /// Capacity not yet reserved.
    pub fn headroom(&self, now: I) -> f64 {
        self.capacity(now) - self.reserved
    }
}

/// KME adjacency graph with per-edge capacity and reservations.
#[derive(Debug)]
pub struct CapacityGraph<I> {
    window_span: Duration,
    sample_interval: Duration,
    expected_nodes: Option<usize>,
    expected_links: Option<usize>,
    nodes: BTreeMap<KmeId, String>,
    adjacency: BTreeMap<KmeId, BTreeSet<KmeId>>,
    edges: HashMap<(KmeId, KmeId), Edge<I>>,
    links: HashMap<LinkId, (KmeId, KmeId)>,
    paths: Option<HashMap<(KmeId, KmeId), Vec<KmeId>>>,
}

fn edge_key(a: KmeId, b: KmeId) -> (KmeId, KmeId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl<I> CapacityGraph<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Empty graph.
    ///
    /// Each edge's window spans `window_span` with one slot per
    /// `sample_interval`.
    pub fn new(
        window_span: Duration,
        sample_interval: Duration,
        expected_nodes: Option<usize>,
        expected_links: Option<usize>,
    ) -> Self {
        Self {
            window_span,
            sample_interval,
            expected_nodes,
            expected_links,
            nodes: BTreeMap::new(),
            adjacency: BTreeMap::new(),
            edges: HashMap::new(),
            links: HashMap::new(),
            paths: None,
        }
    }

    /// Adds a KME. Returns false if it was already known.
    pub fn add_node(&mut self, kme: KmeId, address: String) -> bool {
        if self.nodes.insert(kme, address).is_some() {
            return false;
        }
        self.adjacency.entry(kme).or_default();
        self.topology_changed();
        true
    }

    /// Address a KME registered with.
    pub fn address(&self, kme: KmeId) -> Option<&str> {
        self.nodes.get(&kme).map(String::as_str)
    }

    /// Number of KMEs.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of confirmed links.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Every edge with its end points, lower id first.
    pub fn edges(&self) -> impl Iterator<Item = ((KmeId, KmeId), &Edge<I>)> {
        self.edges.iter().map(|(ends, edge)| (*ends, edge))
    }

    /// Adds the edge for a confirmed link, seeded with one rate sample.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if either end is unknown, the ends coincide, or the
    /// pair is already linked under another link id.
    pub fn add_edge(
        &mut self,
        link_id: LinkId,
        a: KmeId,
        b: KmeId,
        at: I,
        rate: f64,
    ) -> Result<(), QkdError> {
        for kme in [a, b] {
            if !self.nodes.contains_key(&kme) {
                return Err(QkdError::InvalidRequest(format!("kme {kme} is not registered")));
            }
        }
        if a == b {
            return Err(QkdError::InvalidRequest(format!("link {link_id} loops on kme {a}")));
        }
        let key = edge_key(a, b);
        if let Some(existing) = self.edges.get(&key) {
            return Err(QkdError::InvalidRequest(format!(
                "kmes {a} and {b} are already linked by {}",
                existing.link_id
            )));
        }

        let mut window = CapacityWindow::spanning(self.window_span, self.sample_interval);
        window.record(at, rate);
        self.edges.insert(key, Edge { link_id, window, reserved: 0.0 });
        self.links.insert(link_id, key);
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);

        tracing::info!(%link_id, %a, %b, rate, "edge added");
        self.topology_changed();
        Ok(())
    }

    /// Ends of a confirmed link.
    pub fn link_ends(&self, link_id: LinkId) -> Option<(KmeId, KmeId)> {
        self.links.get(&link_id).copied()
    }

    /// Edge between two KMEs.
    pub fn edge(&self, a: KmeId, b: KmeId) -> Option<&Edge<I>> {
        self.edges.get(&edge_key(a, b))
    }

    /// Pushes a rate sample into a link's window.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the link has no edge yet.
    pub fn record(&mut self, link_id: LinkId, at: I, rate: f64) -> Result<(), QkdError> {
        let key = self
            .links
            .get(&link_id)
            .ok_or_else(|| QkdError::InvalidRequest(format!("link {link_id} is not confirmed")))?;
        if let Some(edge) = self.edges.get_mut(key) {
            edge.window.record(at, rate);
        }
        Ok(())
    }

    /// True once a path table exists.
    pub fn has_paths(&self) -> bool {
        self.paths.is_some()
    }

    /// Shortest path between two KMEs, both ends included.
    pub fn shortest_path(&self, src: KmeId, dst: KmeId) -> Option<&[KmeId]> {
        self.paths.as_ref()?.get(&(src, dst)).map(Vec::as_slice)
    }

    /// Looks up the path from `src` to `dst` and checks that every edge can
    /// carry `rate`, plus `overhead` on the first edge of a relayed path.
    ///
    /// Nothing is reserved; pass the result to [`Self::reserve`].
    ///
    /// # Errors
    ///
    /// `PathRejected` if there is no path table yet, no route, or an edge
    /// lacks headroom.
    pub fn find_path(
        &self,
        src: KmeId,
        dst: KmeId,
        rate: f64,
        overhead: f64,
        now: I,
    ) -> Result<Reservation, QkdError> {
        let reject = |reason| QkdError::PathRejected { src, dst, reason };

        let paths = self.paths.as_ref().ok_or_else(|| reject(RejectReason::TopologyIncomplete))?;
        let path = paths.get(&(src, dst)).ok_or_else(|| reject(RejectReason::NoRoute))?;

        let relay = path.len() > 2;
        let mut demand = Vec::with_capacity(path.len().saturating_sub(1));
        for (i, pair) in path.windows(2).enumerate() {
            let (from, to) = (pair[0], pair[1]);
            let requested = if i == 0 && relay { rate + overhead } else { rate };
            let edge = self.edge(from, to).ok_or_else(|| reject(RejectReason::NoRoute))?;

            let headroom = edge.headroom(now);
            if requested > headroom {
                return Err(reject(RejectReason::Capacity { from, to, requested, headroom }));
            }
            demand.push(requested);
        }

        Ok(Reservation { path: path.clone(), demand })
    }

    /// Takes a reservation's rates from its edges.
    pub fn reserve(&mut self, reservation: &Reservation) {
        for ((a, b), rate) in reservation.edges().zip(&reservation.demand) {
            if let Some(edge) = self.edges.get_mut(&edge_key(a, b)) {
                edge.reserved += rate;
            }
        }
    }

    /// Gives a reservation's rates back, clamping each edge at zero.
    pub fn release(&mut self, reservation: &Reservation) {
        for ((a, b), rate) in reservation.edges().zip(&reservation.demand) {
            if let Some(edge) = self.edges.get_mut(&edge_key(a, b)) {
                edge.reserved = (edge.reserved - rate).max(0.0);
            }
        }
    }

    fn topology_changed(&mut self) {
        let complete = match (self.expected_nodes, self.expected_links) {
            (None, None) => {
                self.paths = Some(self.all_pairs());
                return;
            },
            (nodes, links) => {
                nodes.is_none_or(|n| self.nodes.len() >= n)
                    && links.is_none_or(|l| self.edges.len() >= l)
            },
        };

        if complete && self.paths.is_none() {
            self.paths = Some(self.all_pairs());
            tracing::info!(
                nodes = self.nodes.len(),
                links = self.edges.len(),
                "topology complete, path table built"
            );
        }
    }

    /// BFS from every node, neighbours in ascending id order.
    fn all_pairs(&self) -> HashMap<(KmeId, KmeId), Vec<KmeId>> {
        let mut table = HashMap::new();
        for &src in self.adjacency.keys() {
            let mut parent: HashMap<KmeId, KmeId> = HashMap::new();
            let mut queue = VecDeque::from([src]);
            parent.insert(src, src);

            while let Some(node) = queue.pop_front() {
                for &next in self.adjacency.get(&node).into_iter().flatten() {
                    if !parent.contains_key(&next) {
                        parent.insert(next, node);
                        queue.push_back(next);
                    }
                }
            }

            for &dst in parent.keys() {
                let mut path = vec![dst];
                let mut at = dst;
                while let Some(&prev) = parent.get(&at).filter(|_| at != src) {
                    path.push(prev);
                    at = prev;
                }
                path.reverse();
                table.insert((src, dst), path);
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct T(u64);

    impl Sub for T {
        type Output = Duration;

        fn sub(self, rhs: Self) -> Duration {
            Duration::from_secs(self.0.saturating_sub(rhs.0))
        }
    }

    fn graph(nodes: u128) -> CapacityGraph<T> {
        let mut g =
            CapacityGraph::new(Duration::from_secs(15), Duration::from_secs(1), None, None);
        for n in 1..=nodes {
            g.add_node(KmeId(n), format!("kme-{n}"));
        }
        g
    }

    fn link(g: &mut CapacityGraph<T>, a: u128, b: u128, rate: f64) {
        g.add_edge(LinkId(a * 100 + b), KmeId(a), KmeId(b), T(0), rate).unwrap();
    }

    fn ids(path: &[KmeId]) -> Vec<u128> {
        path.iter().map(|k| k.0).collect()
    }

    #[test]
    fn bfs_breaks_ties_by_ascending_id() {
        // Square 1-2-4 and 1-3-4
        let mut g = graph(4);
        link(&mut g, 1, 3, 10.0);
        link(&mut g, 3, 4, 10.0);
        link(&mut g, 1, 2, 10.0);
        link(&mut g, 2, 4, 10.0);

        assert_eq!(ids(g.shortest_path(KmeId(1), KmeId(4)).unwrap()), vec![1, 2, 4]);
        assert_eq!(ids(g.shortest_path(KmeId(4), KmeId(1)).unwrap()), vec![4, 2, 1]);
        assert_eq!(ids(g.shortest_path(KmeId(3), KmeId(3)).unwrap()), vec![3]);
    }

    #[test]
    fn overhead_only_on_first_edge_of_relayed_path() {
        let mut g = graph(3);
        link(&mut g, 1, 2, 100.0);
        link(&mut g, 2, 3, 100.0);

        let relayed = g.find_path(KmeId(1), KmeId(3), 10.0, 30.0, T(0)).unwrap();
        assert_eq!(relayed.demand, vec![40.0, 10.0]);

        let direct = g.find_path(KmeId(1), KmeId(2), 10.0, 30.0, T(0)).unwrap();
        assert_eq!(direct.demand, vec![10.0]);
    }

    #[test]
    fn rejection_reserves_nothing() {
        let mut g = graph(3);
        link(&mut g, 1, 2, 100.0);
        link(&mut g, 2, 3, 5.0);

        let err = g.find_path(KmeId(1), KmeId(3), 10.0, 0.0, T(0)).unwrap_err();
        assert!(matches!(
            err,
            QkdError::PathRejected { reason: RejectReason::Capacity { from: KmeId(2), .. }, .. }
        ));
        assert!(g.edge(KmeId(1), KmeId(2)).unwrap().reserved().abs() < f64::EPSILON);
    }

    #[test]
    fn release_clamps_at_zero() {
        let mut g = graph(2);
        link(&mut g, 1, 2, 10.0);
        let r = g.find_path(KmeId(1), KmeId(2), 6.0, 0.0, T(0)).unwrap();

        g.reserve(&r);
        g.release(&r);
        g.release(&r);
        assert!(g.edge(KmeId(1), KmeId(2)).unwrap().reserved().abs() < f64::EPSILON);
    }

    #[test]
    fn disconnected_nodes_have_no_route() {
        let g = graph(2);
        let err = g.find_path(KmeId(1), KmeId(2), 1.0, 0.0, T(0)).unwrap_err();
        assert!(matches!(err, QkdError::PathRejected { reason: RejectReason::NoRoute, .. }));
    }

    #[test]
    fn expected_topology_freezes_path_table() {
        let mut g =
            CapacityGraph::new(Duration::from_secs(15), Duration::from_secs(1), Some(3), Some(1));
        for n in 1..=3 {
            g.add_node(KmeId(n), String::new());
        }
        assert!(!g.has_paths());
        let err = g.find_path(KmeId(1), KmeId(2), 1.0, 0.0, T(0)).unwrap_err();
        assert!(matches!(
            err,
            QkdError::PathRejected { reason: RejectReason::TopologyIncomplete, .. }
        ));

        link(&mut g, 1, 2, 10.0);
        assert!(g.has_paths());

        // Later links do not change the frozen table
        link(&mut g, 2, 3, 10.0);
        assert!(g.shortest_path(KmeId(1), KmeId(3)).is_none());
    }

    #[test]
    fn duplicate_pair_is_rejected() {
        let mut g = graph(2);
        link(&mut g, 1, 2, 10.0);
        let err = g.add_edge(LinkId(77), KmeId(2), KmeId(1), T(0), 10.0).unwrap_err();
        assert!(matches!(err, QkdError::InvalidRequest(_)));
    }
}
