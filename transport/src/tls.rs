use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::{Arc, Mutex};

/// Certificate verifier that accepts the handshake and records the leaf
/// certificate so the caller can pin its fingerprint.
///
/// Chain validation is intentionally absent: peers present self-signed
/// certificates, and authenticity comes from comparing the SHA-256 of the
/// presented DER against the pinned fingerprint (or the signed handshake on
/// first contact). TLS signature checks still run against the presented key.
#[derive(Debug)]
pub struct CapturingVerifier {
    provider: Arc<CryptoProvider>,
    captured: Arc<Mutex<Option<Vec<u8>>>>,
}

impl CapturingVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self {
            provider,
            captured: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle for reading the captured certificate after a request.
    pub fn captured(&self) -> Arc<Mutex<Option<Vec<u8>>>> {
        Arc::clone(&self.captured)
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.captured.lock().expect("verifier mutex") = Some(end_entity.as_ref().to_vec());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
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

/// Build a rustls client configuration around a capturing verifier.
pub fn pinning_client_config() -> (rustls::ClientConfig, Arc<Mutex<Option<Vec<u8>>>>) {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = CapturingVerifier::new(Arc::clone(&provider));
    let captured = verifier.captured();
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are supported")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    (config, captured)
}
