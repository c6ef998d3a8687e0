//! Request authentication
//!
//! Static credential checks applied before a request enters the forwarding
//! pipeline. Unauthenticated requests are answered with 401 and never
//! forwarded.

use base64::Engine;
use http::header::AUTHORIZATION;
use http::request::Parts;
use std::collections::HashSet;
use tracing::warn;

/// A pluggable authentication check
pub trait AuthMethod: Send + Sync {
    /// Whether this request may be forwarded
    fn authenticate(&self, parts: &Parts) -> bool;
}

/// Accepts every request
#[derive(Debug, Default)]
pub struct NoAuth;

impl AuthMethod for NoAuth {
    fn authenticate(&self, _parts: &Parts) -> bool {
        true
    }
}

/// Bearer-token authentication against a static token set
#[derive(Debug)]
pub struct TokenAuth {
    valid_tokens: HashSet<String>,
}

impl TokenAuth {
    /// Create from a list of valid tokens
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            valid_tokens: tokens.into_iter().collect(),
        }
    }
}

impl AuthMethod for TokenAuth {
    fn authenticate(&self, parts: &Parts) -> bool {
        let Some(value) = parts.headers.get(AUTHORIZATION) else {
            return false;
        };
        let Ok(value) = value.to_str() else {
            return false;
        };

        let token = value.strip_prefix("Bearer ").unwrap_or(value);
        self.valid_tokens.contains(token)
    }
}

/// Basic authentication against a single credential pair
#[derive(Debug)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    /// Create from a username and password
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl AuthMethod for BasicAuth {
    fn authenticate(&self, parts: &Parts) -> bool {
        let Some(value) = parts.headers.get(AUTHORIZATION) else {
            return false;
        };
        let Ok(value) = value.to_str() else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = credentials.split_once(':') else {
            return false;
        };

        user == self.username && pass == self.password
    }
}

/// Log and report an authentication outcome
pub fn check(method: &dyn AuthMethod, parts: &Parts) -> bool {
    let authorized = method.authenticate(parts);
    if !authorized {
        warn!("request unauthorized: {} {}", parts.method, parts.uri);
    }
    authorized
}
