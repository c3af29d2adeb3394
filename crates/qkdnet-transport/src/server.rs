//! QUIC request server.
//!
//! Every exchange is one bidirectional stream: the caller writes a CBOR
//! request and finishes its side, the server answers with one CBOR response
//! and finishes. Streams are independent, so a slow relay chain on one
//! stream never blocks another.
//!
//! # Security
//!
//! TLS 1.3 via `rustls`, ALPN `qkdnet`. Self-signed certificates are
//! generated when no PEM files are given; they are only fit for local
//! emulation.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use qkdnet_core::{
    QkdError,
    message::{decode, encode},
};
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::ServerError;

/// ALPN protocol identifier shared by server and client.
pub const ALPN_PROTOCOL: &[u8] = b"qkdnet";

/// Largest message accepted on a stream.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Service behind a [`QuicServer`].
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Request type decoded from each stream.
    type Request: DeserializeOwned + Send;
    /// Response type written back.
    type Response: Serialize + Send;

    /// Serves one request. Failures are reported inside the response.
    async fn handle(&self, request: Self::Request) -> Self::Response;

    /// Response for a stream whose request could not be decoded.
    fn malformed(&self, err: QkdError) -> Self::Response;
}

/// QUIC endpoint serving a [`RequestHandler`].
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    /// Binds a server endpoint.
    ///
    /// If `cert_path` and `key_path` are both given they are used for TLS,
    /// otherwise a self-signed certificate is generated.
    pub fn bind(
        address: &str,
        cert_path: Option<String>,
        key_path: Option<String>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(&cert, &key)?,
            _ => generate_self_signed_config()?,
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!(%addr, "QUIC server bound");
        Ok(Self { endpoint })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }

    /// Accepts connections until the endpoint closes.
    pub async fn serve<H: RequestHandler>(self, handler: Arc<H>) -> Result<(), ServerError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => handle_connection(conn, handler).await,
                    Err(e) => tracing::warn!(error = %e, "incoming connection failed"),
                }
            });
        }
        Err(ServerError::Transport("endpoint closed".to_string()))
    }

    /// Stops accepting and closes open connections.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

async fn handle_connection<H: RequestHandler>(conn: quinn::Connection, handler: Arc<H>) {
    let remote = conn.remote_address();
    tracing::debug!(%remote, "connection accepted");

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(send, recv, handler.as_ref()).await {
                        tracing::debug!(%remote, error = %e, "stream failed");
                    }
                });
            },
            Err(e) => {
                tracing::debug!(%remote, error = %e, "connection closed");
                break;
            },
        }
    }
}

async fn handle_stream<H: RequestHandler>(
    mut send: SendStream,
    mut recv: RecvStream,
    handler: &H,
) -> Result<(), ServerError> {
    let bytes = recv
        .read_to_end(MAX_MESSAGE_SIZE)
        .await
        .map_err(|e| ServerError::Transport(format!("read failed: {e}")))?;

    let response = match decode::<H::Request>(&bytes) {
        Ok(request) => handler.handle(request).await,
        Err(err) => {
            tracing::warn!(error = %err, len = bytes.len(), "undecodable request");
            handler.malformed(err)
        },
    };

    let out = encode(&response).map_err(|e| ServerError::Transport(e.to_string()))?;
    send.write_all(&out).await.map_err(|e| ServerError::Transport(format!("write failed: {e}")))?;
    send.finish().map_err(|e| ServerError::Transport(format!("finish failed: {e}")))?;
    Ok(())
}

/// Load TLS configuration from certificate and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ServerError> {
    use std::fs;

    let cert_pem = fs::read(cert_path)
        .map_err(|e| ServerError::Config(format!("failed to read cert '{cert_path}': {e}")))?;

    let key_pem = fs::read(key_path)
        .map_err(|e| ServerError::Config(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    quic_server_config(tls_config)
}

/// Generate a self-signed certificate for local runs.
fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_chain = vec![cert.cert.der().clone()];
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    tracing::warn!("using self-signed certificate");
    quic_server_config(tls_config)
}

fn quic_server_config(tls_config: rustls::ServerConfig) -> Result<ServerConfig, ServerError> {
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?;
    Ok(ServerConfig::with_crypto(Arc::new(crypto)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn binds_with_self_signed() {
        let server = QuicServer::bind("127.0.0.1:0", None, None).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_address() {
        assert!(matches!(
            QuicServer::bind("invalid:address:format", None, None),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn binds_with_pem_files() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
        key_file.write_all(cert.key_pair.serialize_pem().as_bytes()).unwrap();

        let server = QuicServer::bind(
            "127.0.0.1:0",
            Some(cert_file.path().display().to_string()),
            Some(key_file.path().display().to_string()),
        );
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn missing_pem_file_is_a_config_error() {
        let result = QuicServer::bind(
            "127.0.0.1:0",
            Some("/nonexistent/cert.pem".to_string()),
            Some("/nonexistent/key.pem".to_string()),
        );
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
