//! Controller driver.
//!
//! Owns the capacity graph, the half-registered links and the Connection
//! Directory. Like the KME driver it is Sans-IO: [`ControllerDriver::handle`]
//! mutates state and returns the calls to KMEs that must follow. Every
//! admission decision happens inside one `handle`, so reservations are
//! linearizable with respect to concurrent opens and closes.

use std::collections::HashMap;

use qkdnet_core::{
    ConfigError, ControllerConfig, Environment, KmeId, Ksid, LinkId, QkdError, Registration,
    SessionRecord, SessionRef,
    message::{ControllerRequest, ControllerResponse, KmeRequest},
};

use crate::{
    directory::{AppRequest, ConnectionDirectory, Matched},
    graph::CapacityGraph,
};

/// Outbound effect of a controller request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    /// Call a KME.
    CallKme {
        /// Target KME.
        kme: KmeId,
        /// Request to send.
        request: KmeRequest,
    },
    /// Record a KME's address in the transport.
    LearnAddress {
        /// The KME.
        kme: KmeId,
        /// Where it serves.
        address: String,
    },
}

/// Result of handling one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStep {
    /// Reply for the caller, sent once every action has run.
    pub reply: ControllerResponse,
    /// Calls to make, in order.
    pub actions: Vec<ControllerAction>,
    /// Session to tear down if an action fails.
    pub abort_on_failure: Option<Ksid>,
}

impl ControllerStep {
    fn reply(reply: ControllerResponse) -> Self {
        Self { reply, actions: Vec::new(), abort_on_failure: None }
    }

    fn ack() -> Self {
        Self::reply(ControllerResponse::Ack)
    }
}

/// First end of a link to report it.
#[derive(Debug, Clone, Copy)]
struct HalfLink {
    kme: KmeId,
    rate: f64,
}

/// Sans-IO state machine of the SDN controller.
pub struct ControllerDriver<E: Environment> {
    env: E,
    config: ControllerConfig,
    graph: CapacityGraph<E::Instant>,
    half_links: HashMap<LinkId, HalfLink>,
    directory: ConnectionDirectory<E::Instant>,
}

impl<E: Environment> ControllerDriver<E> {
    /// Creates a controller with an empty topology.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the configuration is inconsistent.
    pub fn new(env: E, config: ControllerConfig) -> Result<Self, QkdError> {
        config.validate().map_err(|e: ConfigError| QkdError::InvalidRequest(e.to_string()))?;

        let graph = CapacityGraph::new(
            config.capacity_window,
            config.sample_interval,
            config.expected_nodes,
            config.expected_links,
        );
        let directory = ConnectionDirectory::new(config.pending_ttl);
        Ok(Self { env, config, graph, half_links: HashMap::new(), directory })
    }

    /// The capacity graph, for inspection.
    pub fn graph(&self) -> &CapacityGraph<E::Instant> {
        &self.graph
    }

    /// The Connection Directory, for inspection.
    pub fn directory(&self) -> &ConnectionDirectory<E::Instant> {
        &self.directory
    }

    /// Handles one request.
    ///
    /// # Errors
    ///
    /// Any [`QkdError`]. A rejected request leaves graph and directory as
    /// they were.
    pub fn handle(&mut self, request: ControllerRequest) -> Result<ControllerStep, QkdError> {
        match request {
            ControllerRequest::RegisterKme { address } => Ok(self.register_kme(address)),
            ControllerRequest::NewLink { link_id, kme, rate, ttl_secs } => {
                self.new_link(link_id, kme, rate, ttl_secs)
            },
            ControllerRequest::UpdateLink { link_id, rate } => self.update_link(link_id, rate),
            ControllerRequest::RegisterApp { src, dst, kme, qos, master } => {
                self.register_app(AppRequest { src, dst, kme, qos, master })
            },
            ControllerRequest::CloseConnection { ksid } => self.close_connection(ksid),
        }
    }

    /// Tears down a session whose path could not be set up.
    pub fn abort_session(&mut self, ksid: Ksid) {
        if let Some((_, reservation)) = self.directory.close(ksid) {
            self.graph.release(&reservation);
            tracing::warn!(%ksid, "session aborted, reservation released");
        }
    }

    fn register_kme(&mut self, address: String) -> ControllerStep {
        let kme = KmeId::random(&self.env);
        self.graph.add_node(kme, address.clone());
        tracing::info!(%kme, %address, nodes = self.graph.node_count(), "kme registered");

        ControllerStep {
            reply: ControllerResponse::KmeRegistered(kme),
            actions: vec![ControllerAction::LearnAddress { kme, address }],
            abort_on_failure: None,
        }
    }

    fn new_link(
        &mut self,
        link_id: LinkId,
        kme: KmeId,
        rate: f64,
        ttl_secs: u64,
    ) -> Result<ControllerStep, QkdError> {
        if self.graph.address(kme).is_none() {
            return Err(QkdError::InvalidRequest(format!("kme {kme} is not registered")));
        }

        // Announcements keep coming until the KME hears LinkConfirmed.
        if let Some((a, b)) = self.graph.link_ends(link_id) {
            if kme != a && kme != b {
                return Err(QkdError::InvalidRequest(format!(
                    "link {link_id} joins {a} and {b}, not {kme}"
                )));
            }
            self.graph.record(link_id, self.env.now(), rate)?;
            return Ok(self.confirm(link_id, a, b));
        }

        match self.half_links.get(&link_id).copied() {
            Some(half) if half.kme != kme => {
                self.graph.add_edge(link_id, half.kme, kme, self.env.now(), rate.min(half.rate))?;
                self.half_links.remove(&link_id);
                tracing::info!(%link_id, a = %half.kme, b = %kme, ttl_secs, "link confirmed");
                Ok(self.confirm(link_id, half.kme, kme))
            },
            _ => {
                self.half_links.insert(link_id, HalfLink { kme, rate });
                tracing::debug!(%link_id, %kme, "half link recorded");
                Ok(ControllerStep::ack())
            },
        }
    }

    /// Tells both ends of a link who is on the other side.
    fn confirm(&self, link_id: LinkId, a: KmeId, b: KmeId) -> ControllerStep {
        let mut step = ControllerStep::ack();
        for (kme, companion) in [(a, b), (b, a)] {
            let address = self.graph.address(companion).unwrap_or_default().to_string();
            step.actions.push(ControllerAction::CallKme {
                kme,
                request: KmeRequest::LinkConfirmed { link_id, companion, address },
            });
        }
        step
    }

    fn update_link(&mut self, link_id: LinkId, rate: f64) -> Result<ControllerStep, QkdError> {
        if let Some(half) = self.half_links.get_mut(&link_id) {
            half.rate = rate;
            return Ok(ControllerStep::ack());
        }
        self.graph.record(link_id, self.env.now(), rate)?;
        tracing::trace!(%link_id, rate, "rate sample");
        Ok(ControllerStep::ack())
    }

    fn register_app(&mut self, request: AppRequest) -> Result<ControllerStep, QkdError> {
        if self.graph.address(request.kme).is_none() {
            return Err(QkdError::InvalidRequest(format!("kme {} is not registered", request.kme)));
        }

        let now = self.env.now();
        let (master, slave) = match self.directory.register(request, now) {
            Matched::Pending => {
                tracing::debug!(
                    src = %request.src,
                    dst = %request.dst,
                    master = request.master,
                    "registration pending"
                );
                return Ok(ControllerStep::reply(ControllerResponse::Session(
                    Registration::Pending,
                )));
            },
            Matched::Pair { master, slave } => (master, slave),
        };

        let rate = request.qos.rate();
        let overhead = self.config.overhead_policy.overhead(rate, self.config.prefetch_keys);
        let reservation = match self.graph.find_path(master.kme, slave.kme, rate, overhead, now) {
            Ok(reservation) => reservation,
            Err(err) => {
                // The waiting side stays waiting.
                let counterpart = if request.master { slave } else { master };
                self.directory.requeue(counterpart, now);
                tracing::warn!(
                    src = %request.src,
                    dst = %request.dst,
                    error = %err,
                    "connection refused"
                );
                return Err(err);
            },
        };
        self.graph.reserve(&reservation);

        let record = SessionRecord {
            ksid: Ksid::random(&self.env),
            src: request.src,
            dst: request.dst,
            kme_src: master.kme,
            kme_dst: slave.kme,
            qos: request.qos,
            path: reservation.path.clone(),
            created_at: self.env.wall_clock_secs(),
        };
        let ksid = record.ksid;

        tracing::info!(
            %ksid,
            kme_src = %record.kme_src,
            kme_dst = %record.kme_dst,
            hops = record.path.len(),
            rate,
            "path reserved"
        );

        let actions = record
            .path
            .iter()
            .map(|&kme| ControllerAction::CallKme {
                kme,
                request: KmeRequest::AssignSession { record: record.clone() },
            })
            .collect();
        self.directory.open(record, reservation);

        Ok(ControllerStep {
            reply: ControllerResponse::Session(Registration::Registered(ksid)),
            actions,
            abort_on_failure: Some(ksid),
        })
    }

    fn close_connection(&mut self, ksid: Ksid) -> Result<ControllerStep, QkdError> {
        let (record, reservation) =
            self.directory.close(ksid).ok_or(QkdError::SessionNotFound(SessionRef::Ksid(ksid)))?;
        self.graph.release(&reservation);

        tracing::info!(%ksid, src = %record.src, dst = %record.dst, "connection closed");
        Ok(ControllerStep::ack())
    }
}
