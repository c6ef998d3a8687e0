//! Certificate manager
//!
//! Owns the server's cryptographic identity: generates self-signed
//! certificates, persists them to disk, and keeps the [`CertificateStore`]
//! fresh with a periodic rotation loop that never interrupts service.

use super::store::CertificateStore;
use super::{load_certs, load_private_key, CertificateConfig, KeyProfile, TlsError};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Callback invoked with the new identity after a successful rotation
pub type RotationObserver = Box<dyn Fn(&Arc<CertifiedKey>) + Send + Sync>;

/// Callback invoked when a rotation attempt fails
pub type ErrorObserver = Box<dyn Fn(&TlsError) + Send + Sync>;

struct RotationHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Generates, persists and rotates the proxy's TLS identity
pub struct CertManager {
    cert_path: PathBuf,
    key_path: PathBuf,
    config: CertificateConfig,
    store: Arc<CertificateStore>,
    rotation: Mutex<Option<RotationHandle>>,
    on_rotation: Option<RotationObserver>,
    on_error: Option<ErrorObserver>,
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CertManager {
    /// Create a manager persisting to the given certificate and key paths
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        config: CertificateConfig,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            config,
            store: Arc::new(CertificateStore::new()),
            rotation: Mutex::new(None),
            on_rotation: None,
            on_error: None,
        }
    }

    /// Register an observer for successful rotations
    pub fn with_rotation_observer(mut self, observer: RotationObserver) -> Self {
        self.on_rotation = Some(observer);
        self
    }

    /// Register an observer for failed rotations
    pub fn with_error_observer(mut self, observer: ErrorObserver) -> Self {
        self.on_error = Some(observer);
        self
    }

    /// The store consulted by handshakes
    pub fn store(&self) -> Arc<CertificateStore> {
        Arc::clone(&self.store)
    }

    /// Generate a fresh key pair and self-signed certificate, persisting
    /// both as PEM to the configured paths (overwriting prior contents)
    pub fn generate_identity(&self) -> Result<(), TlsError> {
        let key_pair = generate_key_pair(self.config.key_profile)?;

        let mut params = CertificateParams::new(vec![self.config.common_name.clone()])?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.config.common_name.clone());
        dn.push(DnType::OrganizationName, self.config.organization.clone());
        dn.push(DnType::CountryName, self.config.country.clone());
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + self.config.validity;

        let serial = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        params.serial_number = Some(SerialNumber::from(serial));

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = if self.config.is_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::NoCa
        };

        let cert = params.self_signed(&key_pair)?;

        std::fs::write(&self.cert_path, cert.pem())?;
        std::fs::write(&self.key_path, key_pair.serialize_pem())?;

        Ok(())
    }

    /// Load the persisted identity from disk into a rustls signing key
    fn load_identity(&self) -> Result<Arc<CertifiedKey>, TlsError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;
        let signing_key = any_supported_type(&key)
            .map_err(|e| TlsError::InvalidMaterial(e.to_string()))?;
        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }

    /// Regenerate, reload and swap the current identity
    ///
    /// On failure the previously installed identity remains in force.
    pub fn rotate(&self) -> Result<Arc<CertifiedKey>, TlsError> {
        self.generate_identity()?;
        let identity = self.load_identity()?;
        self.store.install(Arc::clone(&identity));
        Ok(identity)
    }

    /// Load the persisted identity, install it, and build a TLS server
    /// config whose certificate resolver reads the store at handshake time
    pub fn load_server_config(&self) -> Result<rustls::ServerConfig, TlsError> {
        let identity = self.load_identity()?;
        self.store.install(identity);

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(self.store() as Arc<dyn ResolvesServerCert>);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Begin rotating the identity on the given interval
    ///
    /// Only one rotation loop is active per manager; calling again cancels
    /// the previous loop first.
    pub fn start_rotation(self: Arc<Self>, interval: Duration) {
        self.stop_rotation();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let manager = Arc::clone(&self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the identity was already
            // installed at startup, so consume it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.rotate() {
                            Ok(identity) => {
                                info!("TLS certificate rotated");
                                if let Some(observer) = &manager.on_rotation {
                                    observer(&identity);
                                }
                            }
                            Err(e) => {
                                warn!("certificate rotation failed, keeping previous identity: {}", e);
                                if let Some(observer) = &manager.on_error {
                                    observer(&e);
                                }
                            }
                        }
                    }
                    _ = cancel_rx.changed() => break,
                }
            }
        });

        if let Ok(mut guard) = self.rotation.lock() {
            *guard = Some(RotationHandle { cancel_tx, task });
        }
    }

    /// Cancel the active rotation loop; idempotent if none is running
    pub fn stop_rotation(&self) {
        let handle = match self.rotation.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.cancel_tx.send(true);
            handle.task.abort();
        }
    }
}

impl Drop for CertManager {
    fn drop(&mut self) {
        self.stop_rotation();
    }
}

fn generate_key_pair(profile: KeyProfile) -> Result<KeyPair, rcgen::Error> {
    match profile {
        KeyProfile::Modern => KeyPair::generate(),
        KeyProfile::Compat => KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
            .or_else(|_| KeyPair::generate()),
    }
}
