//! QUIC client side: [`QuicNetwork`] implements the node's outbound calls.
//!
//! KMEs are addressed by id. Addresses are learned from the controller's
//! link confirmations; the controller itself is configured up front. One
//! connection per remote address is kept open and reused, a failed call
//! drops it so the next call reconnects.

#![allow(clippy::disallowed_types, reason = "Address book is read from a sync trait method")]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use qkdnet_core::{
    KmeId, Peer, PeerNetwork, TransportError,
    message::{ControllerRequest, ControllerResponse, KmeRequest, KmeResponse, decode, encode},
};
use quinn::{ClientConfig, Endpoint};
use serde::{Serialize, de::DeserializeOwned};

use crate::server::{ALPN_PROTOCOL, MAX_MESSAGE_SIZE};

/// Outbound QUIC calls of one node.
pub struct QuicNetwork {
    endpoint: Endpoint,
    controller: SocketAddr,
    peers: RwLock<HashMap<KmeId, SocketAddr>>,
    connections: tokio::sync::Mutex<HashMap<SocketAddr, quinn::Connection>>,
}

impl QuicNetwork {
    /// Client endpoint calling the controller at `controller`.
    pub fn new(controller: &str) -> Result<Self, TransportError> {
        let controller = parse_addr(controller)?;
        let bind: SocketAddr = if controller.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };

        let mut endpoint = Endpoint::client(bind)
            .map_err(|e| TransportError::Connect(format!("endpoint creation failed: {e}")))?;
        endpoint.set_default_client_config(insecure_client_config()?);

        Ok(Self {
            endpoint,
            controller,
            peers: RwLock::new(HashMap::new()),
            connections: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Registers a KME's address directly.
    pub fn add_peer(&self, kme: KmeId, address: &str) -> Result<(), TransportError> {
        let addr = parse_addr(address)?;
        self.book().insert(kme, addr);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn book(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<KmeId, SocketAddr>> {
        self.peers.write().expect("address book poisoned")
    }

    #[allow(clippy::expect_used)]
    fn lookup(&self, kme: KmeId) -> Result<SocketAddr, TransportError> {
        self.peers
            .read()
            .expect("address book poisoned")
            .get(&kme)
            .copied()
            .ok_or(TransportError::UnknownPeer(Peer::Kme(kme)))
    }

    async fn connection(&self, addr: SocketAddr) -> Result<quinn::Connection, TransportError> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&addr)
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }

        let conn = self
            .endpoint
            .connect(addr, "localhost")
            .map_err(|e| TransportError::Connect(format!("connect to {addr} failed: {e}")))?
            .await
            .map_err(|e| TransportError::Connect(format!("connection to {addr} failed: {e}")))?;
        tracing::debug!(%addr, "connected");
        connections.insert(addr, conn.clone());
        Ok(conn)
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        addr: SocketAddr,
        request: &Req,
    ) -> Result<Resp, TransportError> {
        let result = self.exchange(addr, request).await;
        if matches!(result, Err(TransportError::Stream(_))) {
            self.connections.lock().await.remove(&addr);
        }
        result
    }

    async fn exchange<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        addr: SocketAddr,
        request: &Req,
    ) -> Result<Resp, TransportError> {
        let bytes = encode(request).map_err(|e| TransportError::Codec(e.to_string()))?;
        let conn = self.connection(addr).await?;

        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(format!("open_bi failed: {e}")))?;
        send.write_all(&bytes)
            .await
            .map_err(|e| TransportError::Stream(format!("write failed: {e}")))?;
        send.finish().map_err(|e| TransportError::Stream(format!("finish failed: {e}")))?;

        let reply = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| TransportError::Stream(format!("read failed: {e}")))?;
        decode(&reply).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

#[async_trait]
impl PeerNetwork for QuicNetwork {
    async fn call_kme(
        &self,
        kme: KmeId,
        request: KmeRequest,
    ) -> Result<KmeResponse, TransportError> {
        let addr = self.lookup(kme)?;
        tracing::trace!(%kme, %addr, request = request.name(), "calling kme");
        self.call(addr, &request).await
    }

    async fn call_controller(
        &self,
        request: ControllerRequest,
    ) -> Result<ControllerResponse, TransportError> {
        tracing::trace!(request = request.name(), "calling controller");
        self.call(self.controller, &request).await
    }

    fn learn_address(&self, kme: KmeId, address: &str) {
        match parse_addr(address) {
            Ok(addr) => {
                self.book().insert(kme, addr);
            },
            Err(e) => tracing::warn!(%kme, address, error = %e, "ignoring bad peer address"),
        }
    }
}

fn parse_addr(address: &str) -> Result<SocketAddr, TransportError> {
    address
        .parse()
        .map_err(|e| TransportError::Connect(format!("invalid address '{address}': {e}")))
}

/// Client config that accepts any server certificate.
///
/// Emulated networks run with self-signed certificates on every node.
fn insecure_client_config() -> Result<ClientConfig, TransportError> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();

    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Connect(format!("QUIC client config error: {e}")))?;
    let mut config = ClientConfig::new(Arc::new(quic));

    let mut transport = quinn::TransportConfig::default();
    let idle = quinn::IdleTimeout::try_from(Duration::from_secs(30))
        .map_err(|e| TransportError::Connect(format!("idle timeout: {e}")))?;
    transport.max_idle_timeout(Some(idle));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

/// Certificate verifier that accepts any certificate.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
