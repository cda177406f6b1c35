//! TLS certificate pinning for self-signed gateways.
//!
//! A pinned connection skips CA-chain validation and instead requires the
//! leaf certificate's SHA-256 fingerprint to equal the configured value.
//! Handshake signatures are still verified with the crypto provider.

use std::sync::Arc;

use clawlink_core::fingerprint::{normalize_fingerprint, sha256_fingerprint};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::GatewayError;

#[derive(Debug)]
pub struct FingerprintVerifier {
    expected: String,
    provider: Arc<CryptoProvider>,
}

impl FingerprintVerifier {
    pub fn new(expected: &str, provider: Arc<CryptoProvider>) -> Self {
        Self {
            expected: normalize_fingerprint(expected),
            provider,
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = sha256_fingerprint(end_entity.as_ref());
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "gateway tls fingerprint mismatch: expected {}, got {actual}",
                self.expected
            )))
        }
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

/// Client config that trusts exactly the certificate with `fingerprint`.
pub fn pinned_client_config(fingerprint: &str) -> Result<ClientConfig, GatewayError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = FingerprintVerifier::new(fingerprint, Arc::clone(&provider));
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::Tls(format!("gateway tls setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// Compare the peer's leaf certificate against the pin once the socket is open.
pub fn check_peer_fingerprint(
    peer_certificates: Option<&[CertificateDer<'_>]>,
    expected: &str,
) -> Result<(), GatewayError> {
    let leaf = peer_certificates
        .and_then(|certs| certs.first())
        .ok_or_else(|| GatewayError::Tls("gateway tls fingerprint unavailable".into()))?;
    let actual = sha256_fingerprint(leaf.as_ref());
    if actual == normalize_fingerprint(expected) {
        Ok(())
    } else {
        Err(GatewayError::Tls("gateway tls fingerprint mismatch".into()))
    }
}
