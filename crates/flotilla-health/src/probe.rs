//! Protocol-level probes: HTTP, HTTPS, and TCP.
//!
//! HTTPS probes do not verify server certificates; probe targets are
//! cluster-internal addresses with self-signed or agent-local certs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered positively (2xx, or the connect succeeded).
    Healthy,
    /// The endpoint answered negatively (non-2xx).
    Unhealthy,
    /// The probe could not be executed (connect error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// What a probe runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSpec {
    Http { host: String, port: u32, path: String },
    Https { host: String, port: u32, path: String },
    Tcp { host: String, port: u32 },
}

/// Probe execution, abstract so tests can script outcomes.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, spec: &ProbeSpec, timeout: Duration) -> ProbeResult;
}

/// The real network prober.
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, spec: &ProbeSpec, timeout: Duration) -> ProbeResult {
        match spec {
            ProbeSpec::Http { host, port, path } => {
                http_probe(host, *port, path, timeout, false).await
            }
            ProbeSpec::Https { host, port, path } => {
                http_probe(host, *port, path, timeout, true).await
            }
            ProbeSpec::Tcp { host, port } => tcp_probe(host, *port, timeout).await,
        }
    }
}

/// TCP probe: a successful connect is healthy.
pub async fn tcp_probe(host: &str, port: u32, timeout: Duration) -> ProbeResult {
    let address = format!("{host}:{port}");
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await {
        Ok(Ok(_)) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(%address, error = %e, "tcp probe connect failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, "tcp probe timed out");
            ProbeResult::Failed
        }
    }
}

/// HTTP(S) probe: 2xx is healthy, other statuses unhealthy, transport
/// problems failed.
pub async fn http_probe(
    host: &str,
    port: u32,
    path: &str,
    timeout: Duration,
    tls: bool,
) -> ProbeResult {
    let address = format!("{host}:{port}");
    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%address, error = %e, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };
        if tls {
            let connector = TlsConnector::from(insecure_tls_config());
            let server_name = match ServerName::try_from(host.to_string()) {
                Ok(name) => name,
                Err(_) => return ProbeResult::Failed,
            };
            match connector.connect(server_name, stream).await {
                Ok(tls_stream) => send_get(tls_stream, host, path).await,
                Err(e) => {
                    debug!(%address, error = %e, "tls handshake failed");
                    ProbeResult::Failed
                }
            }
        } else {
            send_get(stream, host, path).await
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%address, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

async fn send_get<S>(stream: S, host: &str, path: &str) -> ProbeResult
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "health probe handshake failed");
            return ProbeResult::Failed;
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .header("user-agent", "flotilla-health/0.4")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "health probe request build failed");
            return ProbeResult::Failed;
        }
    };

    match sender.send_request(req).await {
        Ok(resp) => {
            if resp.status().is_success() {
                ProbeResult::Healthy
            } else {
                debug!(status = %resp.status(), "health probe non-2xx");
                ProbeResult::Unhealthy
            }
        }
        Err(e) => {
            debug!(error = %e, "health probe request failed");
            ProbeResult::Failed
        }
    }
}

/// TLS config that accepts any server certificate.
fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Arc::new(config)
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
