//! KME node: runs the driver and executes its actions.
//!
//! The driver sits behind a `tokio::sync::Mutex`, which serialises every
//! mutation of the block pool, the key rows and the session index. The lock
//! is released before any action runs, so a relay chain spanning several
//! KMEs never holds two locks at once.

use std::sync::Arc;

use async_trait::async_trait;
use qkdnet_core::{
    Environment, KmeId, Peer, PeerNetwork, QkdError,
    message::{ControllerRequest, ControllerResponse, KmeRequest, KmeResponse},
};
use qkdnet_transport::RequestHandler;

use crate::{
    driver::{KmeAction, KmeDriver, Reply},
    storage::Storage,
};

/// A running KME.
pub struct KmeNode<E: Environment, S: Storage> {
    id: KmeId,
    driver: tokio::sync::Mutex<KmeDriver<E, S>>,
    network: Arc<dyn PeerNetwork>,
}

impl<E: Environment, S: Storage> KmeNode<E, S> {
    /// Wraps a driver; outbound calls go through `network`.
    pub fn new(driver: KmeDriver<E, S>, network: Arc<dyn PeerNetwork>) -> Self {
        Self { id: driver.id(), driver: tokio::sync::Mutex::new(driver), network }
    }

    /// This KME's identifier.
    pub fn id(&self) -> KmeId {
        self.id
    }

    /// Runs `f` against the driver under the lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&KmeDriver<E, S>) -> R) -> R {
        f(&*self.driver.lock().await)
    }

    /// Serves one request, errors folded into the response.
    pub async fn handle(&self, request: KmeRequest) -> KmeResponse {
        let name = request.name();
        match self.try_handle(request).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_fatal() {
                    tracing::error!(kme = %self.id, request = name, error = %err, "request failed");
                } else {
                    tracing::warn!(kme = %self.id, request = name, error = %err, "request failed");
                }
                KmeResponse::Error(err.to_reply())
            },
        }
    }

    /// Serves one request.
    ///
    /// # Errors
    ///
    /// The driver's error, or the first failure of a required action.
    /// Locally stored keys of a failed request are discarded.
    pub async fn try_handle(&self, request: KmeRequest) -> Result<KmeResponse, QkdError> {
        let step = self.driver.lock().await.handle(request)?;

        let mut controller_reply = None;
        for action in step.actions {
            let required = action.required();
            match self.execute(action).await {
                Ok(Some(reply)) => controller_reply = Some(reply),
                Ok(None) => {},
                Err(err) if required => {
                    if !step.discard_on_failure.is_empty() {
                        self.driver.lock().await.discard_keys(&step.discard_on_failure);
                    }
                    return Err(err);
                },
                Err(err) => {
                    tracing::warn!(kme = %self.id, error = %err, "notification failed");
                },
            }
        }

        match step.reply {
            Reply::Ready(response) => Ok(response),
            Reply::FromController => match controller_reply {
                Some(ControllerResponse::Session(registration)) => {
                    Ok(KmeResponse::Session(registration))
                },
                other => Err(QkdError::ProtocolViolation(format!(
                    "controller answered registration with {other:?}"
                ))),
            },
        }
    }

    async fn execute(&self, action: KmeAction) -> Result<Option<ControllerResponse>, QkdError> {
        match action {
            KmeAction::CallKme { kme, request, .. } => {
                self.network
                    .call_kme(kme, request)
                    .await
                    .map_err(|e| e.unreachable(Peer::Kme(kme)))?
                    .into_result()?;
                Ok(None)
            },
            KmeAction::CallController { request, .. } => {
                let response = self
                    .network
                    .call_controller(request)
                    .await
                    .map_err(|e| e.unreachable(Peer::Controller))?
                    .into_result()?;
                Ok(Some(response))
            },
            KmeAction::LearnAddress { kme, address } => {
                self.network.learn_address(kme, &address);
                Ok(None)
            },
        }
    }
}

#[async_trait]
impl<E: Environment, S: Storage> RequestHandler for KmeNode<E, S> {
    type Request = KmeRequest;
    type Response = KmeResponse;

    async fn handle(&self, request: KmeRequest) -> KmeResponse {
        KmeNode::handle(self, request).await
    }

    fn malformed(&self, err: QkdError) -> KmeResponse {
        KmeResponse::Error(err.to_reply())
    }
}

/// Joins the network: the controller assigns this KME its identifier.
///
/// # Errors
///
/// - `PeerUnreachable` if the controller cannot be called.
/// - `ProtocolViolation` if it answers with anything but an identifier.
pub async fn register(network: &dyn PeerNetwork, address: &str) -> Result<KmeId, QkdError> {
    let response = network
        .call_controller(ControllerRequest::RegisterKme { address: address.to_string() })
        .await
        .map_err(|e| e.unreachable(Peer::Controller))?
        .into_result()?;

    match response {
        ControllerResponse::KmeRegistered(id) => {
            tracing::info!(kme = %id, address, "registered with controller");
            Ok(id)
        },
        other => Err(QkdError::ProtocolViolation(format!(
            "controller answered kme registration with {other:?}"
        ))),
    }
}
