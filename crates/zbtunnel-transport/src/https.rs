//! HTTPS CONNECT proxy layer
//!
//! Same CONNECT exchange as the HTTP layer, but carried inside a TLS
//! session with the proxy. The TLS stream rides the parent transport
//! through an in-process byte pump, so the layer composes over any stack,
//! not just a bare socket.

use crate::http::{connect_request, read_connect_reply};
use crate::{Transport, TransportError};
use async_trait::async_trait;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use zbtunnel_config::HopConfig;

/// Capacity of the in-process pipe between the TLS session and the parent.
const PIPE_CAPACITY: usize = 8192;

enum State {
    /// Before `init`: I/O goes straight to the parent.
    Plain(Box<dyn Transport>),
    /// After `init`: I/O goes through the TLS session; the pump task owns
    /// the parent.
    Tls {
        stream: TlsStream<DuplexStream>,
        pump: JoinHandle<()>,
    },
    Closed,
}

pub struct HttpsConnectTransport {
    state: State,
    username: String,
    password: String,
    server_name: String,
    versions: &'static [&'static rustls::SupportedProtocolVersion],
}

const TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];

impl HttpsConnectTransport {
    pub fn new(parent: Box<dyn Transport>, hop: &HopConfig) -> Result<Self, TransportError> {
        let versions = match hop.get_or("ssl_type", "sslv23") {
            "sslv23" => rustls::ALL_VERSIONS,
            "tls1" => TLS12_ONLY,
            other => {
                return Err(TransportError::Tls(format!(
                    "unsupported ssl_type: {other}"
                )))
            }
        };

        Ok(Self {
            state: State::Plain(parent),
            username: hop.get_or("username", "").to_owned(),
            password: hop.get_or("password", "").to_owned(),
            server_name: hop.require("host")?.to_owned(),
            versions,
        })
    }
}

#[async_trait]
impl Transport for HttpsConnectTransport {
    async fn init(&mut self) -> Result<(), TransportError> {
        let parent = match std::mem::replace(&mut self.state, State::Closed) {
            State::Plain(parent) => parent,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        ensure_crypto_provider();
        let config = rustls::ClientConfig::builder_with_protocol_versions(self.versions)
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let pump = tokio::spawn(run_pump(parent, remote));

        debug!("starting TLS handshake with {}", self.server_name);
        let stream = connector
            .connect(server_name, local)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        self.state = State::Tls { stream, pump };
        Ok(())
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if host.is_empty() {
            return Err(TransportError::BadAddress);
        }

        let mut request = connect_request(host, port, &self.username, &self.password);
        debug!("sending CONNECT {}:{} inside TLS", host, port);
        self.send(&mut request).await?;
        read_connect_reply(self).await
    }

    async fn send(&mut self, data: &mut [u8]) -> Result<(), TransportError> {
        match &mut self.state {
            State::Plain(parent) => parent.send(data).await,
            State::Tls { stream, .. } => {
                stream.write_all(data).await?;
                stream.flush().await?;
                Ok(())
            }
            State::Closed => Err(TransportError::Closed),
        }
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match &mut self.state {
            State::Plain(parent) => parent.recv(buf).await,
            State::Tls { stream, .. } => Ok(stream.read(buf).await?),
            State::Closed => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Plain(mut parent) => parent.close().await,
            State::Tls { mut stream, pump } => {
                let _ = stream.shutdown().await;
                // The pump owns the parent; aborting it drops the socket.
                pump.abort();
            }
            State::Closed => {}
        }
    }

    fn is_open(&self) -> bool {
        match &self.state {
            State::Plain(parent) => parent.is_open(),
            State::Tls { .. } => true,
            State::Closed => false,
        }
    }
}

/// Shuttle bytes between the TLS session's pipe end and the parent stack.
async fn run_pump(mut parent: Box<dyn Transport>, mut link: DuplexStream) {
    let mut outbound = [0u8; PIPE_CAPACITY];
    let mut inbound = [0u8; PIPE_CAPACITY];
    loop {
        tokio::select! {
            read = link.read(&mut outbound) => match read {
                Ok(n) if n > 0 => {
                    if parent.send(&mut outbound[..n]).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
            read = parent.recv(&mut inbound) => match read {
                Ok(n) if n > 0 => {
                    if link.write_all(&inbound[..n]).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
        }
    }
    parent.close().await;
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE): upstream HTTPS
// proxies are routinely addressed by IP or self-signed.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
