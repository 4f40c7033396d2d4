//! TLS context construction and client-side handshakes.
//!
//! The context is an injectable configuration object: callers may supply
//! their own rustls `ClientConfig`, point at a CA bundle on disk, or use
//! the webpki-roots default trust store.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Shareable client-side TLS configuration.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    /// Context trusting the bundled webpki root certificates.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
        }
    }

    /// Context trusting only the certificates in the given PEM bundle.
    pub fn with_ca_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut roots = RootCertStore::empty();
        let mut loaded = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            roots
                .add(cert?)
                .map_err(|e| Error::Configuration(format!("invalid CA certificate: {e}")))?;
            loaded += 1;
        }
        if loaded == 0 {
            return Err(Error::Configuration(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), count = loaded, "loaded CA bundle");
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wrap a caller-provided rustls configuration.
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Context that skips certificate verification entirely.
    ///
    /// Only suitable for tests against self-signed fixtures.
    pub fn danger_accept_invalid() -> Self {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
        }
    }

    /// Run the TLS handshake for `host` over an established transport.
    ///
    /// The transport may be a direct socket or a proxy tunnel; by the
    /// time this runs they are indistinguishable byte pipes.
    pub(crate) async fn handshake(&self, host: &str, io: TcpStream) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Configuration(format!("invalid TLS server name: {host}")))?;
        let connector = TlsConnector::from(Arc::clone(&self.config));
        let stream = connector.connect(server_name, io).await?;
        Ok(stream)
    }
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsContext")
    }
}

mod danger {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate without verification.
    #[derive(Debug)]
    pub(super) struct NoVerification {
        provider: CryptoProvider,
    }

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self {
                provider: ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_builds_from_webpki_roots() {
        let ctx = TlsContext::new();
        // A usable config was produced and is cheaply cloneable.
        let clone = ctx.clone();
        assert!(Arc::ptr_eq(&ctx.config, &clone.config));
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let err = TlsContext::with_ca_file(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn danger_context_builds() {
        let _ctx = TlsContext::danger_accept_invalid();
    }
}
