//! Proxy request pipeline
//!
//! Provides:
//! - The forwarding core: mode resolution, transport construction and the
//!   request/response transform pipeline
//! - The dispatch service racing each forward against its timeout
//! - The bounded worker pool

mod core;
mod request;
mod response;
mod worker;

pub use self::core::{Mode, ProxyCore, ProxyService};
pub use worker::{WorkerPool, WorkerPoolConfig};

use crate::obfuscation::ObfuscationError;
use crate::tls::TlsError;
use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unable to determine destination host")]
    MissingDestination,

    #[error("cannot proxy to self: {0}")]
    SelfLoop(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("request timed out")]
    Timeout,

    #[error("worker pool stopped")]
    PoolStopped,

    #[error("worker abandoned the job")]
    WorkerGone,

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("obfuscation error: {0}")]
    Obfuscation(#[from] ObfuscationError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

/// Build a plain-text response with the given status
pub(crate) fn status_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(message.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Map a pipeline error to the response the caller sees
pub(crate) fn error_response(error: &ProxyError) -> Response<Full<Bytes>> {
    use tracing::warn;

    match error {
        ProxyError::MissingDestination => {
            warn!("{}", error);
            status_response(
                StatusCode::BAD_REQUEST,
                "Unable to determine destination host",
            )
        }
        ProxyError::SelfLoop(_) => {
            warn!("{}", error);
            status_response(StatusCode::BAD_REQUEST, "Cannot proxy to self")
        }
        ProxyError::Timeout => {
            warn!("request timed out or was cancelled");
            status_response(StatusCode::GATEWAY_TIMEOUT, "Request timed out")
        }
        ProxyError::PoolStopped => {
            warn!("{}", error);
            status_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
        }
        _ => {
            warn!("forward failed: {}", error);
            status_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}
