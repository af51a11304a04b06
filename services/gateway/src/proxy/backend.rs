//! Backend (RDP server) connection management.
//!
//! The gateway opens a plain TCP connection, lets the X.224 negotiation run
//! in the clear, and then upgrades the same socket to TLS in place.
//!
//! Certificates are never validated here. The browser client receives the
//! full chain in the RDCleanPath response and makes its own trust decision;
//! the gateway only moves bytes.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::SessionError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend stream after the TLS upgrade.
pub type BackendStream = TlsStream<TcpStream>;

/// Accepts any server certificate while still checking handshake signatures
/// against the presented key.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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

/// Build the TLS client configuration used for every backend.
///
/// TLS 1.2 is the default ceiling; most Windows RDP servers negotiate it
/// reliably.
pub fn tls_client_config(allow_tls13: bool) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(ring::default_provider());
    let versions: &[&'static rustls::SupportedProtocolVersion] = if allow_tls13 {
        &[&rustls::version::TLS13, &rustls::version::TLS12]
    } else {
        &[&rustls::version::TLS12]
    };

    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_no_client_auth();

    Ok(config)
}

/// Dials RDP servers and upgrades the connections to TLS.
#[derive(Clone)]
pub struct BackendConnector {
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl BackendConnector {
    /// Create a connector with the given timeout and TLS policy.
    pub fn new(connect_timeout: Duration, allow_tls13: bool) -> Result<Self, rustls::Error> {
        let config = tls_client_config(allow_tls13)?;
        Ok(Self {
            connect_timeout,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Open a TCP connection to `destination` (`host:port`).
    pub async fn dial(&self, destination: &str) -> Result<TcpStream, SessionError> {
        debug!(destination = %destination, "Connecting to backend");

        match timeout(self.connect_timeout, TcpStream::connect(destination)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY on backend socket");
                }
                Ok(stream)
            }
            Ok(Err(source)) => Err(SessionError::Dial {
                destination: destination.to_string(),
                source,
            }),
            Err(_) => Err(SessionError::DialTimeout {
                destination: destination.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Run a TLS client handshake over an existing connection.
    pub async fn upgrade(
        &self,
        stream: TcpStream,
        destination: &str,
    ) -> Result<BackendStream, SessionError> {
        let server_name = server_name(destination)?;
        self.tls
            .connect(server_name, stream)
            .await
            .map_err(SessionError::TlsHandshake)
    }
}

/// DER bytes of every certificate the server presented, leaf first.
pub fn peer_cert_chain(stream: &BackendStream) -> Result<Vec<Vec<u8>>, SessionError> {
    collect_cert_chain(stream.get_ref().1.peer_certificates())
}

fn collect_cert_chain(
    certs: Option<&[CertificateDer<'static>]>,
) -> Result<Vec<Vec<u8>>, SessionError> {
    match certs {
        Some(certs) if !certs.is_empty() => Ok(certs.iter().map(|c| c.as_ref().to_vec()).collect()),
        _ => Err(SessionError::NoPeerCertificates),
    }
}

/// TLS server name for a `host:port` destination.
fn server_name(destination: &str) -> Result<ServerName<'static>, SessionError> {
    let host = destination
        .rsplit_once(':')
        .map_or(destination, |(host, _port)| host);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(host.to_string())
        .map_err(|_| SessionError::InvalidServerName(destination.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_dns() {
        let name = server_name("rdp.example.test:3389").unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn test_server_name_ip() {
        assert!(matches!(
            server_name("192.0.2.10:3389").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("[2001:db8::1]:3389").unwrap(),
            ServerName::IpAddress(_)
        ));
    }

    #[test]
    fn test_server_name_invalid() {
        let err = server_name("bad host!:3389").unwrap_err();
        assert_eq!(err.reason_code(), "invalid_server_name");
    }

    #[test]
    fn test_collect_cert_chain_requires_a_certificate() {
        assert!(matches!(
            collect_cert_chain(None),
            Err(SessionError::NoPeerCertificates)
        ));
        assert!(matches!(
            collect_cert_chain(Some(&[][..])),
            Err(SessionError::NoPeerCertificates)
        ));
    }

    #[test]
    fn test_collect_cert_chain_keeps_order() {
        let certs = vec![
            CertificateDer::from(vec![0x01, 0x02]),
            CertificateDer::from(vec![0x03]),
        ];
        let chain = collect_cert_chain(Some(certs.as_slice())).unwrap();
        assert_eq!(chain, vec![vec![0x01, 0x02], vec![0x03]]);
    }

    #[test]
    fn test_tls_client_config_versions() {
        assert!(tls_client_config(false).is_ok());
        assert!(tls_client_config(true).is_ok());
    }
}
