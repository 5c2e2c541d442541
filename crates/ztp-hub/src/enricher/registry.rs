//! Certificate chain presented by a mirror registry
//!
//! The chain is taken from the TLS handshake without verifying it; the
//! edge cluster is then told to trust exactly what the registry presented.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TLS_PORT: u16 = 443;

/// Reads the certificates a TLS server presents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// PEM encoded chain presented by `address` (`host:port`)
    async fn fetch(&self, address: &str) -> Result<Vec<u8>>;
}

/// Fetches certificates with a TLS handshake
#[derive(Clone, Debug, Default)]
pub struct TlsCertificateSource;

#[async_trait]
impl CertificateSource for TlsCertificateSource {
    async fn fetch(&self, address: &str) -> Result<Vec<u8>> {
        let (host, _) = split_address(address)?;
        let provider = Arc::new(ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::internal_with_context("registry TLS", e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::validation_for("registry", format!("'{}' isn't a valid server name: {}", host, e)))?;

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| Error::transport(format!("timed out connecting to '{}'", address)))?
            .map_err(|e| Error::transport(format!("failed to connect to '{}': {}", address, e)))?;
        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::transport(format!("TLS handshake with '{}' failed: {}", address, e)))?;

        let (_, session) = tls.get_ref();
        let chain: Vec<::pem::Pem> = session
            .peer_certificates()
            .unwrap_or_default()
            .iter()
            .map(|der| ::pem::Pem::new("CERTIFICATE", der.to_vec()))
            .collect();
        debug!(address = %address, certificates = chain.len(), "Fetched registry certificates");
        if chain.is_empty() {
            return Err(Error::transport(format!("'{}' presented no certificates", address)));
        }
        Ok(::pem::encode_many(&chain).into_bytes())
    }
}

/// `host:port` for a registry URL, defaulting to the HTTPS port
///
/// Accepts bare hosts, `host:port` and URLs with a scheme or path.
pub fn registry_address(url: &str) -> String {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    let has_port = match authority.rfind(':') {
        Some(colon) => !authority[colon..].contains(']'),
        None => false,
    };
    if has_port {
        authority.to_string()
    } else {
        format!("{}:{}", authority, DEFAULT_TLS_PORT)
    }
}

fn split_address(address: &str) -> Result<(&str, &str)> {
    address
        .rsplit_once(':')
        .map(|(host, port)| (host.trim_start_matches('[').trim_end_matches(']'), port))
        .ok_or_else(|| Error::validation_for("registry", format!("address '{}' has no port", address)))
}

/// Accepts any server certificate; handshake signatures are still checked
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_address_defaults_to_https_port() {
        assert_eq!(registry_address("registry.example.com"), "registry.example.com:443");
        assert_eq!(registry_address("registry.example.com:5000"), "registry.example.com:5000");
        assert_eq!(
            registry_address("https://registry.example.com:8443/ocp4/openshift4"),
            "registry.example.com:8443"
        );
        assert_eq!(registry_address("[fd00::5]"), "[fd00::5]:443");
    }

    #[test]
    fn test_split_address_strips_brackets() {
        assert_eq!(split_address("[fd00::5]:443").unwrap(), ("fd00::5", "443"));
        assert!(split_address("registry").is_err());
    }

    #[tokio::test]
    async fn test_closed_port_fails_with_transport_error() {
        let err = TlsCertificateSource.fetch("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
