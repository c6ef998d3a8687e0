//! TLS identity management
//!
//! Provides:
//! - Self-signed certificate issuance and PEM persistence
//! - A certificate store read by every handshake, hot-swapped on rotation
//! - Upstream (client-side) TLS policy construction

mod manager;
mod store;

pub use manager::CertManager;
pub use store::CertificateStore;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// TLS errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),
}

/// Which key algorithm newly generated identities use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyProfile {
    /// ECDSA P-256 (fast, small)
    #[default]
    Modern,
    /// RSA, falling back to ECDSA where RSA generation is unavailable
    Compat,
}

/// Parameters for self-signed certificate generation
#[derive(Debug, Clone)]
pub struct CertificateConfig {
    /// Subject common name (also used as the DNS SAN)
    pub common_name: String,
    /// Subject organization
    pub organization: String,
    /// Subject country
    pub country: String,
    /// Validity window starting now
    pub validity: Duration,
    /// Key algorithm profile
    pub key_profile: KeyProfile,
    /// Whether the certificate carries the CA basic constraint
    pub is_ca: bool,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            common_name: "localhost".to_string(),
            organization: "Veil".to_string(),
            country: "US".to_string(),
            validity: Duration::from_secs(90 * 24 * 60 * 60),
            key_profile: KeyProfile::Modern,
            is_ca: false,
        }
    }
}

/// Load a certificate chain from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidMaterial(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.display().to_string()));
    }
    Ok(certs)
}

/// Load a private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::InvalidMaterial(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Build the client-side TLS policy used when forwarding to HTTPS upstreams
///
/// Verifies the upstream against the webpki root set by default. Passing
/// `insecure = true` disables peer verification entirely — a development
/// posture only, and loudly logged as such.
pub fn upstream_client_config(insecure: bool) -> Result<rustls::ClientConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    if insecure {
        warn!("upstream TLS verification disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification));
    }

    Ok(config)
}

/// Verifier that accepts any upstream certificate
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_config_builds() {
        assert!(upstream_client_config(false).is_ok());
        assert!(upstream_client_config(true).is_ok());
    }

    #[test]
    fn test_default_certificate_config() {
        let config = CertificateConfig::default();
        assert_eq!(config.common_name, "localhost");
        assert!(!config.is_ca);
        assert_eq!(config.key_profile, KeyProfile::Modern);
    }
}
