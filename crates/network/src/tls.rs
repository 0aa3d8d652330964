//! Optional TLS over an established (possibly proxied) TCP stream.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::stream::MaybeTlsStream;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    Disabled,
    /// Chain and hostname validated against the webpki roots
    Verified,
    /// Handshake completes without any certificate or hostname checks
    Insecure,
}

impl TlsMode {
    pub fn from_flags(use_tls: bool, allow_insecure: bool) -> Self {
        match (use_tls, allow_insecure) {
            (false, _) => TlsMode::Disabled,
            (true, false) => TlsMode::Verified,
            (true, true) => TlsMode::Insecure,
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self != TlsMode::Disabled
    }
}

/// Connectors for both TLS modes, built once per client.
#[derive(Clone)]
pub struct TlsConnectors {
    verified: TlsConnector,
    insecure: TlsConnector,
}

impl TlsConnectors {
    pub fn new() -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let verified = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TunnelError::Config(format!("TLS setup failed: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let insecure = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TunnelError::Config(format!("TLS setup failed: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::new(&provider)))
            .with_no_client_auth();

        Ok(Self {
            verified: TlsConnector::from(Arc::new(verified)),
            insecure: TlsConnector::from(Arc::new(insecure)),
        })
    }

    /// Runs the handshake for `mode`, or passes the stream through when disabled.
    pub async fn wrap(
        &self,
        stream: TcpStream,
        host: &str,
        mode: TlsMode,
        timeout: Duration,
    ) -> Result<MaybeTlsStream> {
        let connector = match mode {
            TlsMode::Disabled => return Ok(MaybeTlsStream::Plain(stream)),
            TlsMode::Verified => &self.verified,
            TlsMode::Insecure => &self.insecure,
        };

        let server_name = ServerName::try_from(host.to_string()).map_err(|e| TunnelError::Tls {
            host: host.to_string(),
            reason: format!("invalid server name: {}", e),
        })?;

        debug!("TLS handshake with {} ({:?})", host, mode);

        match tokio::time::timeout(timeout, connector.connect(server_name, stream)).await {
            Err(_) => Err(TunnelError::timeout(
                format!("TLS handshake with {}", host),
                timeout,
            )),
            Ok(Err(e)) => Err(TunnelError::Tls {
                host: host.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(tls)) => Ok(MaybeTlsStream::Tls(Box::new(tls))),
        }
    }
}

/// Accepts every certificate and handshake signature.
#[derive(Debug)]
struct AcceptAnyCertificate {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyCertificate {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
