//! TLS transport towards the upstream resolver (DNS over TLS, RFC 7858).
//!
//! An [`UpstreamConnector`] holds the shared `ClientConfig` and dials new
//! [`UpstreamLink`]s. A link is one TLS session carrying length-prefixed
//! frames; it performs exactly one query/response exchange at a time.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConnectError, ForwardError};
use crate::frame::{Frame, read_frame, write_frame};

/// Conventional DNS-over-TLS port.
pub const DEFAULT_DOT_PORT: u16 = 853;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How the upstream certificate is checked.
#[derive(Debug, Clone)]
pub enum Verification {
    /// Verify against the Mozilla root set plus any extra roots.
    WebPki {
        extra_roots: Vec<CertificateDer<'static>>,
    },
    /// Accept any certificate. Encrypts the transport but authenticates
    /// nothing; only for resolvers reached by IP without a usable name.
    Insecure,
}

impl Default for Verification {
    fn default() -> Self {
        Verification::WebPki {
            extra_roots: Vec::new(),
        }
    }
}

impl Verification {
    /// WebPKI verification that also trusts the certificates in a PEM file.
    pub fn with_ca_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::CaFile {
            path: path.display().to_string(),
            source,
        })?;

        let extra_roots = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConfigError::CaFile {
                path: path.display().to_string(),
                source,
            })?;

        Ok(Verification::WebPki { extra_roots })
    }
}

/// Where and how to reach the upstream resolver.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Resolver host name or IP address.
    pub host: String,
    pub port: u16,
    /// Name sent as SNI and checked against the certificate. Defaults to `host`.
    pub tls_name: Option<String>,
    pub verification: Verification,
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Links idle for longer are discarded instead of reused.
    pub link_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "8.8.8.8".to_string(),
            port: DEFAULT_DOT_PORT,
            tls_name: None,
            verification: Verification::default(),
            connect_timeout: Duration::from_secs(5),
            link_idle_timeout: Duration::from_secs(20),
        }
    }
}

impl UpstreamConfig {
    /// `host:port` as used for connecting and logging.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Dials TLS sessions to the configured resolver.
pub struct UpstreamConnector {
    config: UpstreamConfig,
    server_name: ServerName<'static>,
    tls: TlsConnector,
    backoff: Mutex<Backoff>,
    connects: AtomicU64,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig) -> Result<Self, ConfigError> {
        let name = config.tls_name.clone().unwrap_or_else(|| config.host.clone());
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| ConfigError::ServerName(name))?;

        let client_config = build_client_config(&config.verification)?;

        Ok(Self {
            config,
            server_name,
            tls: TlsConnector::from(client_config),
            backoff: Mutex::new(Backoff::default()),
            connects: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Number of links successfully established so far.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Establish a new link: TCP connect then TLS handshake, together
    /// bounded by the connect timeout.
    pub async fn connect(&self) -> Result<UpstreamLink, ConnectError> {
        if let Some(wait) = self.backoff_remaining() {
            return Err(ConnectError::BackingOff(wait));
        }

        let result = tokio::time::timeout(self.config.connect_timeout, self.dial())
            .await
            .unwrap_or_else(|_| Err(ConnectError::Timeout(self.config.authority())));

        match &result {
            Ok(link) => {
                self.record_success();
                self.connects.fetch_add(1, Ordering::Relaxed);
                debug!(upstream = %link.peer, "TLS link established");
            }
            Err(e) => {
                let wait = self.record_failure();
                warn!(upstream = %self.config.authority(), error = %e, backoff_ms = wait.as_millis() as u64, "upstream connect failed");
            }
        }

        result
    }

    async fn dial(&self) -> Result<UpstreamLink, ConnectError> {
        let authority = self.config.authority();
        let mut addrs = tokio::net::lookup_host(authority.as_str())
            .await
            .map_err(|source| ConnectError::Resolve {
                host: self.config.host.clone(),
                source,
            })?;

        let addr = addrs.next().ok_or_else(|| ConnectError::Resolve {
            host: self.config.host.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        })?;

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| ConnectError::Tcp { addr, source })?;
        let _ = tcp.set_nodelay(true);

        let stream = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|source| ConnectError::Handshake { addr, source })?;

        Ok(UpstreamLink::new(stream, addr))
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.remaining(Instant::now())
    }

    fn record_success(&self) {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.reset();
    }

    fn record_failure(&self) -> Duration {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.fail(Instant::now())
    }
}

/// Exponential hold-off after consecutive connect failures.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.retry_at
            .and_then(|at| at.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    fn fail(&mut self, now: Instant) -> Duration {
        let shift = self.failures.min(16);
        let wait = BACKOFF_BASE.saturating_mul(1 << shift).min(BACKOFF_MAX);
        self.failures = self.failures.saturating_add(1);
        self.retry_at = Some(now + wait);
        wait
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

/// One TLS session to the upstream resolver.
pub struct UpstreamLink {
    stream: TlsStream<TcpStream>,
    peer: SocketAddr,
    exchanges: u64,
    last_used: Instant,
}

impl UpstreamLink {
    fn new(stream: TlsStream<TcpStream>, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            exchanges: 0,
            last_used: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the link already completed an exchange.
    pub fn is_reused(&self) -> bool {
        self.exchanges > 0
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Send `query` and read exactly one response frame.
    ///
    /// The write and the read are each bounded by `timeout`. The response is
    /// returned as received; matching its ID is up to the caller.
    pub async fn forward(&mut self, query: &Frame, timeout: Duration) -> Result<Frame, ForwardError> {
        tokio::time::timeout(timeout, write_frame(&mut self.stream, query))
            .await
            .map_err(|_| ForwardError::Timeout(timeout))??;

        let response = tokio::time::timeout(timeout, read_frame(&mut self.stream))
            .await
            .map_err(|_| ForwardError::Timeout(timeout))??;

        let response = response.ok_or_else(|| {
            ForwardError::ConnectionReset(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed the link",
            ))
        })?;

        self.exchanges += 1;
        self.last_used = Instant::now();

        Ok(response)
    }
}

fn build_client_config(verification: &Verification) -> Result<Arc<rustls::ClientConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = match verification {
        Verification::WebPki { extra_roots } => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            for cert in extra_roots {
                roots.add(cert.clone()).map_err(ConfigError::CaCertificate)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        Verification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Certificate verifier for [`Verification::Insecure`]. Handshake signatures
/// are still checked so the session keys belong to whoever sent the
/// certificate.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_google() {
        let config = UpstreamConfig::default();

        assert_eq!(config.authority(), "8.8.8.8:853");
        assert!(matches!(config.verification, Verification::WebPki { .. }));
    }

    #[test]
    fn authority_brackets_ipv6() {
        let config = UpstreamConfig {
            host: "2001:4860:4860::8888".to_string(),
            ..Default::default()
        };

        assert_eq!(config.authority(), "[2001:4860:4860::8888]:853");
    }

    #[test]
    fn connector_accepts_ip_server_name() {
        let connector = UpstreamConnector::new(UpstreamConfig::default()).unwrap();

        assert!(matches!(connector.server_name, ServerName::IpAddress(_)));
    }

    #[test]
    fn connector_uses_tls_name_override() {
        let config = UpstreamConfig {
            tls_name: Some("dns.google".to_string()),
            verification: Verification::Insecure,
            ..Default::default()
        };
        let connector = UpstreamConnector::new(config).unwrap();

        assert!(matches!(connector.server_name, ServerName::DnsName(_)));
    }

    #[test]
    fn connector_rejects_bad_server_name() {
        let config = UpstreamConfig {
            tls_name: Some("not a hostname".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            UpstreamConnector::new(config),
            Err(ConfigError::ServerName(_))
        ));
    }

    #[test]
    fn missing_ca_file() {
        let result = Verification::with_ca_file(Path::new("/nonexistent/ca.pem"));

        assert!(matches!(result, Err(ConfigError::CaFile { .. })));
    }

    #[test]
    fn backoff_grows_and_resets() {
        let now = Instant::now();
        let mut backoff = Backoff::default();

        assert!(backoff.remaining(now).is_none());
        assert_eq!(backoff.fail(now), Duration::from_millis(100));
        assert_eq!(backoff.fail(now), Duration::from_millis(200));
        assert_eq!(backoff.fail(now), Duration::from_millis(400));
        assert!(backoff.remaining(now).is_some());
        assert!(backoff.remaining(now + Duration::from_secs(1)).is_none());

        backoff.reset();
        assert!(backoff.remaining(now).is_none());
    }

    #[test]
    fn backoff_is_capped() {
        let now = Instant::now();
        let mut backoff = Backoff::default();

        for _ in 0..40 {
            backoff.fail(now);
        }

        assert_eq!(backoff.fail(now), BACKOFF_MAX);
    }

    #[tokio::test]
    async fn connect_refused_starts_backoff() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = UpstreamConnector::new(UpstreamConfig {
            host: "127.0.0.1".to_string(),
            port,
            verification: Verification::Insecure,
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            connector.connect().await,
            Err(ConnectError::Tcp { .. })
        ));
        assert!(matches!(
            connector.connect().await,
            Err(ConnectError::BackingOff(_))
        ));
    }
}
