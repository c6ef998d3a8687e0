//! Certificate store
//!
//! Holds the proxy's one active TLS identity. Rotation replaces the whole
//! identity under a write lock; handshakes take the read lock and clone the
//! `Arc`, so a handshake in flight during a swap keeps the identity it
//! already captured. No identity is ever mutated in place.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::{Arc, RwLock};

/// Lock-protected holder of the current TLS identity
///
/// Implements [`ResolvesServerCert`], so installing the store as a rustls
/// certificate resolver makes every handshake read the identity current at
/// handshake time rather than the one captured at config-build time — the
/// indirection that makes hot rotation possible.
pub struct CertificateStore {
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertificateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// Replace the current identity wholesale
    pub fn install(&self, identity: Arc<CertifiedKey>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(identity);
        }
    }

    /// The identity currently in force, if any
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.current.read().ok()?.clone()
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaded = self.current().is_some();
        f.debug_struct("CertificateStore")
            .field("loaded", &loaded)
            .finish()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}
