//! TLS connector for the WAN control channel and the SmartLink broker.
//!
//! Both vendor TLS endpoints (the radio's public control port and the
//! broker) present certificates that are not hostname-verifiable, so the
//! connector installs an explicit accept-all verifier. The verifier is
//! deliberately not public beyond this module's connect functions: the
//! rest of the workspace cannot opt any other endpoint into it.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use flexlink_core::error::{Error, Result};

use crate::tcp;

/// Certificate verifier that accepts any server certificate.
///
/// The vendor infrastructure predates hostname-strict verification; the
/// radio presents a self-issued certificate on its public TLS port and
/// the broker's chain does not match its hostname.
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
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
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
        ]
    }
}

/// Build the client configuration used for vendor endpoints.
fn vendor_client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Arc::new(config)
}

/// Connect a TLS stream to a vendor endpoint, accepting its certificate.
///
/// The TCP connect and the TLS handshake each get the full `timeout`.
/// Returns [`Error::Timeout`] if either phase exceeds it, or
/// [`Error::Transport`] on connect/handshake failure.
pub async fn connect_vendor(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let addr = format!("{host}:{port}");
    let tcp = tcp::connect(&addr, timeout).await?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::InvalidParameter(format!("invalid TLS server name {host}: {e}")))?;

    let connector = TlsConnector::from(vendor_client_config());

    tracing::debug!(addr = %addr, "Starting TLS handshake");
    let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| {
            tracing::debug!(addr = %addr, "TLS handshake timed out");
            Error::Timeout
        })?
        .map_err(|e| Error::Transport(format!("TLS handshake with {addr} failed: {e}")))?;

    tracing::debug!(addr = %addr, "TLS handshake complete");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_accepts_any_certificate() {
        let verifier = AcceptAnyCert;
        let cert = CertificateDer::from(vec![0u8; 16]);
        let name = ServerName::try_from("radio.example.invalid".to_string()).unwrap();
        let result =
            verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::since_unix_epoch(
                Duration::from_secs(1_700_000_000),
            ));
        assert!(result.is_ok());
    }

    #[test]
    fn verifier_reports_schemes() {
        let verifier = AcceptAnyCert;
        let schemes = verifier.supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::ED25519));
        assert!(schemes.contains(&SignatureScheme::RSA_PSS_SHA256));
    }

    #[tokio::test]
    async fn connect_vendor_refused() {
        // A port with nothing listening: transport error, not a panic.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_vendor("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
