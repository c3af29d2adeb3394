//! Controller node: runs the driver and executes its actions.
//!
//! The driver's mutex is the capacity-graph lock. It is released before
//! sessions are pushed to the KMEs on their path.

use std::sync::Arc;

use async_trait::async_trait;
use qkdnet_core::{
    Environment, Peer, PeerNetwork, QkdError,
    message::{ControllerRequest, ControllerResponse},
};
use qkdnet_transport::RequestHandler;

use crate::driver::{ControllerAction, ControllerDriver};

/// A running controller.
pub struct ControllerNode<E: Environment> {
    driver: tokio::sync::Mutex<ControllerDriver<E>>,
    network: Arc<dyn PeerNetwork>,
}

impl<E: Environment> ControllerNode<E> {
    /// Wraps a driver; calls to KMEs go through `network`.
    pub fn new(driver: ControllerDriver<E>, network: Arc<dyn PeerNetwork>) -> Self {
        Self { driver: tokio::sync::Mutex::new(driver), network }
    }

    /// Runs `f` against the driver under the lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&ControllerDriver<E>) -> R) -> R {
        f(&*self.driver.lock().await)
    }

    /// Serves one request, errors folded into the response.
    pub async fn handle(&self, request: ControllerRequest) -> ControllerResponse {
        let name = request.name();
        match self.try_handle(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(request = name, error = %err, "request failed");
                ControllerResponse::Error(err.to_reply())
            },
        }
    }

    /// Serves one request.
    ///
    /// # Errors
    ///
    /// The driver's error, or the first failed call to a KME. A session
    /// whose path could not be told about it is torn down again.
    pub async fn try_handle(
        &self,
        request: ControllerRequest,
    ) -> Result<ControllerResponse, QkdError> {
        let step = self.driver.lock().await.handle(request)?;

        for action in step.actions {
            match action {
                ControllerAction::CallKme { kme, request } => {
                    let result = self
                        .network
                        .call_kme(kme, request)
                        .await
                        .map_err(|e| e.unreachable(Peer::Kme(kme)))
                        .and_then(|response| response.into_result());

                    if let Err(err) = result {
                        match step.abort_on_failure {
                            Some(ksid) => {
                                self.driver.lock().await.abort_session(ksid);
                                return Err(err);
                            },
                            None => tracing::warn!(%kme, error = %err, "notification failed"),
                        }
                    }
                },
                ControllerAction::LearnAddress { kme, address } => {
                    self.network.learn_address(kme, &address);
                },
            }
        }

        Ok(step.reply)
    }
}

#[async_trait]
impl<E: Environment> RequestHandler for ControllerNode<E> {
    type Request = ControllerRequest;
    type Response = ControllerResponse;

    async fn handle(&self, request: ControllerRequest) -> ControllerResponse {
        ControllerNode::handle(self, request).await
    }

    fn malformed(&self, err: QkdError) -> ControllerResponse {
        ControllerResponse::Error(err.to_reply())
    }
}
