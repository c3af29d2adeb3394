//! In-process network between simulated nodes.
//!
//! Calls are routed by id straight into the target node's handler. Each
//! request and response still goes through the CBOR codec, so anything
//! that would not survive the real transport fails here too. Every
//! exchange is kept in a transcript for tests to inspect, and nodes can be
//! partitioned to make calls to them fail.

#![allow(clippy::disallowed_types, reason = "Routing table is read from sync trait methods")]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};

use async_trait::async_trait;
use qkdnet_core::{
    KmeId, Peer, PeerNetwork, TransportError,
    message::{ControllerRequest, ControllerResponse, KmeRequest, KmeResponse, decode, encode},
};
use qkdnet_transport::RequestHandler;
use serde::{Serialize, de::DeserializeOwned};

/// A KME as the network sees it.
pub type KmeHandler = Arc<dyn RequestHandler<Request = KmeRequest, Response = KmeResponse>>;

/// The controller as the network sees it.
pub type ControllerHandler =
    Arc<dyn RequestHandler<Request = ControllerRequest, Response = ControllerResponse>>;

/// One request/response pair as it crossed the simulated wire.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Who was called.
    pub to: Peer,
    /// Request name.
    pub request: &'static str,
    /// Encoded request.
    pub request_bytes: Vec<u8>,
    /// Encoded response.
    pub response_bytes: Vec<u8>,
}

impl Exchange {
    /// True if `needle` occurs in the request or the response.
    pub fn carries(&self, needle: &[u8]) -> bool {
        let found = |haystack: &[u8]| haystack.windows(needle.len()).any(|w| w == needle);
        !needle.is_empty() && (found(&self.request_bytes) || found(&self.response_bytes))
    }
}

#[derive(Default)]
struct Routes {
    controller: Option<ControllerHandler>,
    kmes: HashMap<KmeId, KmeHandler>,
    partitioned: HashSet<Peer>,
}

/// Routes calls between in-process nodes.
#[derive(Clone, Default)]
pub struct SimNetwork {
    routes: Arc<RwLock<Routes>>,
    transcript: Arc<Mutex<Vec<Exchange>>>,
}

impl SimNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes controller calls to `handler`.
    pub fn set_controller(&self, handler: ControllerHandler) {
        self.write().controller = Some(handler);
    }

    /// Routes calls for `kme` to `handler`.
    pub fn add_kme(&self, kme: KmeId, handler: KmeHandler) {
        self.write().kmes.insert(kme, handler);
    }

    /// Makes every call to `peer` fail until [`Self::heal`].
    pub fn partition(&self, peer: Peer) {
        tracing::debug!(%peer, "partitioned");
        self.write().partitioned.insert(peer);
    }

    /// Reconnects `peer`.
    pub fn heal(&self, peer: Peer) {
        self.write().partitioned.remove(&peer);
    }

    /// Exchanges so far, oldest first.
    #[allow(clippy::expect_used)]
    pub fn transcript(&self) -> Vec<Exchange> {
        self.transcript.lock().expect("transcript poisoned").clone()
    }

    /// Forgets the exchanges recorded so far.
    #[allow(clippy::expect_used)]
    pub fn clear_transcript(&self) {
        self.transcript.lock().expect("transcript poisoned").clear();
    }

    #[allow(clippy::expect_used)]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Routes> {
        self.routes.read().expect("routes poisoned")
    }

    #[allow(clippy::expect_used)]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Routes> {
        self.routes.write().expect("routes poisoned")
    }

    fn reachable(&self, peer: Peer) -> Result<(), TransportError> {
        if self.read().partitioned.contains(&peer) {
            return Err(TransportError::Connect(format!("{peer} is partitioned")));
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn record(&self, exchange: Exchange) {
        self.transcript.lock().expect("transcript poisoned").push(exchange);
    }
}

fn wire<T: Serialize + DeserializeOwned>(message: &T) -> Result<(T, Vec<u8>), TransportError> {
    let bytes = encode(message).map_err(|e| TransportError::Codec(e.to_string()))?;
    let decoded = decode(&bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
    Ok((decoded, bytes))
}

#[async_trait]
impl PeerNetwork for SimNetwork {
    async fn call_kme(
        &self,
        kme: KmeId,
        request: KmeRequest,
    ) -> Result<KmeResponse, TransportError> {
        let peer = Peer::Kme(kme);
        self.reachable(peer)?;
        let handler =
            self.read().kmes.get(&kme).cloned().ok_or(TransportError::UnknownPeer(peer))?;

        let name = request.name();
        let (request, request_bytes) = wire(&request)?;
        let response = handler.handle(request).await;
        let (response, response_bytes) = wire(&response)?;

        self.record(Exchange { to: peer, request: name, request_bytes, response_bytes });
        Ok(response)
    }

    async fn call_controller(
        &self,
        request: ControllerRequest,
    ) -> Result<ControllerResponse, TransportError> {
        self.reachable(Peer::Controller)?;
        let handler =
            self.read().controller.clone().ok_or(TransportError::UnknownPeer(Peer::Controller))?;

        let name = request.name();
        let (request, request_bytes) = wire(&request)?;
        let response = handler.handle(request).await;
        let (response, response_bytes) = wire(&response)?;

        self.record(Exchange {
            to: Peer::Controller,
            request: name,
            request_bytes,
            response_bytes,
        });
        Ok(response)
    }
}
