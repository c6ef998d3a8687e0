//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Forwarding configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// TLS identity configuration
    #[serde(default)]
    pub tls: TlsConfig,
    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Fixed upstream URL; absent means transparent mode
    pub target: Option<String>,
    /// Static header appended to every outbound request ("Name: value")
    pub static_header: Option<String>,
    /// Per-request response timeout in seconds
    pub response_timeout_secs: u64,
    /// Enable traffic obfuscation
    pub obfuscation: bool,
    /// Skip upstream certificate verification (development only)
    pub insecure_upstream: bool,
    /// Worker pool size (0 = dispatch directly without a pool)
    pub workers: usize,
    /// Worker pool queue capacity
    pub queue_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target: None,
            static_header: None,
            response_timeout_secs: 30,
            obfuscation: false,
            insecure_upstream: false,
            workers: 0,
            queue_capacity: 16,
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Enable the plaintext listener
    pub enable_http: bool,
    /// Plaintext listen address
    pub http_listen: String,
    /// Enable the TLS listener
    pub enable_https: bool,
    /// TLS listen address
    pub https_listen: String,
    /// Redirect plaintext requests to the TLS listener
    pub redirect_to_https: bool,
    /// Graceful shutdown deadline in seconds
    pub shutdown_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable_http: true,
            http_listen: "0.0.0.0:8080".to_string(),
            enable_https: false,
            https_listen: "0.0.0.0:8443".to_string(),
            redirect_to_https: false,
            shutdown_deadline_secs: 30,
        }
    }
}

/// TLS identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate PEM path
    pub cert_file: String,
    /// Private key PEM path
    pub key_file: String,
    /// Certificate subject common name
    pub common_name: String,
    /// Certificate subject organization
    pub organization: String,
    /// Certificate subject country
    pub country: String,
    /// Certificate validity in days
    pub validity_days: u64,
    /// Rotation interval in days
    pub rotation_interval_days: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: "cert.pem".to_string(),
            key_file: "key.pem".to_string(),
            common_name: "localhost".to_string(),
            organization: "Veil".to_string(),
            country: "US".to_string(),
            validity_days: 90,
            rotation_interval_days: 30,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Authentication method: "none", "token" or "basic"
    pub method: String,
    /// Valid tokens (token auth)
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Username (basic auth)
    #[serde(default)]
    pub username: String,
    /// Password (basic auth)
    #[serde(default)]
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: "none".to_string(),
            tokens: Vec::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log file path (optional; stderr if unset)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
