//! TLS for `tcps` endpoints.
//!
//! Servers present the certificate chain named in [`TlsConfig`]. Clients
//! encrypt the link but accept any server certificate: peers are identified
//! by the service directory, not by TLS.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::BoxedStream;
use super::error::SocketError;

/// Certificate material for the server side of `tcps` endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM file holding the certificate chain, leaf first
    pub certificate_chain: PathBuf,
    /// PEM file holding the private key
    pub private_key: PathBuf,
}

impl TlsConfig {
    /// Create a configuration from PEM file paths.
    pub fn new(certificate_chain: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            certificate_chain: certificate_chain.into(),
            private_key: private_key.into(),
        }
    }

    /// Build the acceptor used by listening endpoints.
    pub fn acceptor(&self) -> Result<TlsAcceptor, SocketError> {
        let certificates = CertificateDer::pem_file_iter(&self.certificate_chain)
            .map_err(|e| tls_error(&self.certificate_chain, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_error(&self.certificate_chain, e))?;
        let key = PrivateKeyDer::from_pem_file(&self.private_key)
            .map_err(|e| tls_error(&self.private_key, e))?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| SocketError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certificates, key)
            .map_err(|e| SocketError::Tls(e.to_string()))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn tls_error(path: &std::path::Path, error: impl std::fmt::Display) -> SocketError {
    SocketError::Tls(format!("{}: {}", path.display(), error))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts every server certificate while still checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCertificate {
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn connector() -> Result<TlsConnector, SocketError> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| SocketError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCertificate { provider }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the client handshake over an established TCP stream.
pub(crate) async fn connect(stream: TcpStream, host: &str) -> Result<BoxedStream, SocketError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| SocketError::Handshake(format!("invalid server name {host:?}: {e}")))?;
    let stream = connector()?
        .connect(server_name, stream)
        .await
        .map_err(|e| SocketError::Handshake(e.to_string()))?;
    Ok(Box::new(stream))
}

/// Run the server handshake over an accepted TCP stream.
pub(crate) async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<BoxedStream, SocketError> {
    let stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| SocketError::Handshake(e.to_string()))?;
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_certificate_is_a_tls_error() {
        let config = TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(config.acceptor(), Err(SocketError::Tls(_))));
    }

    #[test]
    fn test_client_connector_builds() {
        assert!(connector().is_ok());
    }
}
