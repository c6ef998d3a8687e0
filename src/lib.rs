//! # Veil Proxy
//!
//! A concurrent forward/reverse HTTP(S) proxy for environments where the
//! proxy must manage its own transport identity and, optionally, disguise
//! the traffic it relays.
//!
//! ## Features
//!
//! - **Transparent and target-specific forwarding**: derive the destination
//!   from each inbound request, or pin every request to one fixed upstream
//! - **Bounded worker pool** applying backpressure instead of unbounded
//!   per-request spawning
//! - **Self-managed TLS identity** with periodic hot rotation — certificate
//!   swaps never restart a listener
//! - **Traffic obfuscation**: encrypted, padded, integrity-checked wire
//!   frames in place of plaintext bodies and headers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Listener Layer                      │
//! │      (plaintext + TLS accept loops, shutdown)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Proxy Core                         │
//! │   (mode resolution, transforms, dispatch, timeout)   │
//! ├─────────────────────────────────────────────────────┤
//! │           Worker Pool (optional, bounded)            │
//! ├─────────────────────────────────────────────────────┤
//! │   Obfuscation Codec        TLS Identity Manager      │
//! │  (encode/decode frames)  (issue, persist, rotate)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod obfuscation;
pub mod proxy;
pub mod server;
pub mod tls;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Server error: {0}")]
    Server(#[from] server::ServerError),

    #[error("Configuration error: {0}")]
    Config(String),
}
