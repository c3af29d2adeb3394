//! Request/response over a real QUIC loopback connection.

use std::sync::Arc;

use async_trait::async_trait;
use qkdnet_core::{
    ErrorKind, KmeId, Ksid, PeerNetwork, QkdError,
    message::{ControllerRequest, ControllerResponse, KmeRequest, KmeResponse},
};
use qkdnet_transport::{QuicNetwork, QuicServer, RequestHandler};

/// Controller stand-in: hands out a fixed id, acks the rest.
struct FixedController;

#[async_trait]
impl RequestHandler for FixedController {
    type Request = ControllerRequest;
    type Response = ControllerResponse;

    async fn handle(&self, request: ControllerRequest) -> ControllerResponse {
        match request {
            ControllerRequest::RegisterKme { .. } => ControllerResponse::KmeRegistered(KmeId(42)),
            _ => ControllerResponse::Ack,
        }
    }

    fn malformed(&self, err: QkdError) -> ControllerResponse {
        ControllerResponse::Error(err.to_reply())
    }
}

/// KME stand-in that rejects everything.
struct Refusing;

#[async_trait]
impl RequestHandler for Refusing {
    type Request = KmeRequest;
    type Response = KmeResponse;

    async fn handle(&self, request: KmeRequest) -> KmeResponse {
        KmeResponse::Error(QkdError::InvalidRequest(request.name().to_string()).to_reply())
    }

    fn malformed(&self, err: QkdError) -> KmeResponse {
        KmeResponse::Error(err.to_reply())
    }
}

fn spawn<H: RequestHandler>(handler: H) -> String {
    let server = QuicServer::bind("127.0.0.1:0", None, None).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.serve(Arc::new(handler)));
    addr
}

#[tokio::test]
async fn controller_call_round_trips() {
    let controller = spawn(FixedController);
    let network = QuicNetwork::new(&controller).unwrap();

    let reply = network
        .call_controller(ControllerRequest::RegisterKme { address: "127.0.0.1:1".to_string() })
        .await
        .unwrap();
    assert_eq!(reply, ControllerResponse::KmeRegistered(KmeId(42)));

    // Second call reuses the connection
    let close = ControllerRequest::CloseConnection { ksid: Ksid(1) };
    let reply = network.call_controller(close).await.unwrap();
    assert_eq!(reply, ControllerResponse::Ack);
}

#[tokio::test]
async fn error_kind_survives_the_hop() {
    let controller = spawn(FixedController);
    let kme = spawn(Refusing);
    let network = QuicNetwork::new(&controller).unwrap();
    network.learn_address(KmeId(7), &kme);

    let reply = network
        .call_kme(KmeId(7), KmeRequest::CloseSession { ksid: Ksid(1), from: None })
        .await
        .unwrap();
    let err = reply.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}
