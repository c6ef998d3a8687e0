//! Listener lifecycle
//!
//! Binds the plaintext and/or TLS listeners, serves every connection through
//! the shared proxy service, and coordinates graceful shutdown: on an
//! interrupt the server stops accepting, stops certificate rotation and the
//! worker pool, then waits — bounded by a deadline — for in-flight
//! connections to finish.

use crate::proxy::ProxyService;
use crate::tls::{CertManager, TlsError};
use bytes::Bytes;
use http::header::HOST;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("no listener could be started")]
    NoListeners,

    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,
}

/// Proxy server tying listeners, service and identity management together
pub struct Server {
    service: Arc<ProxyService>,
    tls_manager: Option<Arc<CertManager>>,
    http_addr: Option<String>,
    https_addr: Option<String>,
    redirect_to_https: bool,
    rotation_interval: Duration,
    shutdown_deadline: Duration,
}

impl Server {
    /// Create a server around the given service
    pub fn new(service: ProxyService) -> Self {
        Self {
            service: Arc::new(service),
            tls_manager: None,
            http_addr: None,
            https_addr: None,
            redirect_to_https: false,
            rotation_interval: Duration::from_secs(30 * 24 * 60 * 60),
            shutdown_deadline: Duration::from_secs(30),
        }
    }

    /// Enable the plaintext listener
    pub fn with_http(mut self, addr: impl Into<String>) -> Self {
        self.http_addr = Some(addr.into());
        self
    }

    /// Enable the TLS listener, served with the manager's rotating identity
    pub fn with_https(mut self, addr: impl Into<String>, manager: Arc<CertManager>) -> Self {
        self.https_addr = Some(addr.into());
        self.tls_manager = Some(manager);
        self
    }

    /// Redirect plaintext requests to the TLS listener
    pub fn with_redirect_to_https(mut self, enable: bool) -> Self {
        self.redirect_to_https = enable;
        self
    }

    /// Override the certificate rotation interval
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    /// Override the graceful-shutdown deadline
    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    /// Run until an interrupt arrives, then shut down gracefully
    pub async fn run(self) -> Result<(), ServerError> {
        let (shutdown_tx, _) = watch::channel(false);
        let mut listeners: Vec<JoinHandle<()>> = Vec::new();

        if let Some(addr) = &self.http_addr {
            match TcpListener::bind(addr.as_str()).await {
                Ok(listener) => {
                    info!("HTTP listener on {}", addr);
                    let https_port = self
                        .https_addr
                        .as_deref()
                        .and_then(|a| a.rsplit_once(':').map(|(_, port)| port.to_string()));
                    let redirect = if self.redirect_to_https {
                        https_port
                    } else {
                        None
                    };
                    listeners.push(tokio::spawn(serve_plain(
                        listener,
                        Arc::clone(&self.service),
                        shutdown_tx.subscribe(),
                        redirect,
                    )));
                }
                // Fatal to this listener only
                Err(e) => error!("failed to bind HTTP listener {}: {}", addr, e),
            }
        }

        if let Some(addr) = &self.https_addr {
            let manager = self.tls_manager.as_ref().ok_or(ServerError::NoListeners)?;
            let tls_config = manager.load_server_config()?;
            Arc::clone(manager).start_rotation(self.rotation_interval);

            match TcpListener::bind(addr.as_str()).await {
                Ok(listener) => {
                    info!("HTTPS listener on {}", addr);
                    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
                    listeners.push(tokio::spawn(serve_tls(
                        listener,
                        acceptor,
                        Arc::clone(&self.service),
                        shutdown_tx.subscribe(),
                    )));
                }
                Err(e) => error!("failed to bind HTTPS listener {}: {}", addr, e),
            }
        }

        if listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!("failed to listen for shutdown signal: {}", e),
        }

        // Stop accepting, then tear down the moving parts in order
        let _ = shutdown_tx.send(true);
        if let Some(manager) = &self.tls_manager {
            manager.stop_rotation();
        }
        self.service.shutdown().await;

        let drain = async {
            for handle in listeners {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(self.shutdown_deadline, drain).await {
            Ok(()) => {
                info!("graceful shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!("shutdown deadline exceeded with connections still in flight");
                Err(ServerError::ShutdownTimeout)
            }
        }
    }
}

async fn serve_plain(
    listener: TcpListener,
    service: Arc<ProxyService>,
    mut shutdown_rx: watch::Receiver<bool>,
    redirect_to_port: Option<String>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("connection from {}", peer);
                    let service = Arc::clone(&service);
                    let redirect = redirect_to_port.clone();
                    connections.spawn(async move {
                        let io = TokioIo::new(stream);
                        let handler = service_fn(move |req| {
                            let service = Arc::clone(&service);
                            let redirect = redirect.clone();
                            async move {
                                let response = match redirect {
                                    Some(port) => redirect_response(&req, &port),
                                    None => service.handle(req, false).await,
                                };
                                Ok::<_, Infallible>(response)
                            }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                            debug!("connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            },
            _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    service: Arc<ProxyService>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("TLS connection from {}", peer);
                    let acceptor = acceptor.clone();
                    let service = Arc::clone(&service);
                    connections.spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                debug!("TLS handshake failed: {}", e);
                                return;
                            }
                        };
                        let io = TokioIo::new(tls_stream);
                        let handler = service_fn(move |req| {
                            let service = Arc::clone(&service);
                            async move { Ok::<_, Infallible>(service.handle(req, true).await) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                            debug!("connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            },
            _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
        }
    }

    while connections.join_next().await.is_some() {}
}

/// 301 to the same host and path on the TLS port
fn redirect_response<B>(req: &http::Request<B>, https_port: &str) -> Response<Full<Bytes>> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| "localhost".to_string());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = format!("https://{}:{}{}", host, https_port, path_and_query);

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = http::header::HeaderValue::from_str(&location) {
        response
            .headers_mut()
            .insert(http::header::LOCATION, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_preserves_path_and_query() {
        let req = http::Request::builder()
            .uri("/search?q=veil")
            .header(HOST, "proxy.example:8080")
            .body(())
            .unwrap();

        let response = redirect_response(&req, "8443");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(http::header::LOCATION).unwrap(),
            "https://proxy.example:8443/search?q=veil"
        );
    }

    #[test]
    fn test_redirect_without_host_falls_back() {
        let req = http::Request::builder().uri("/").body(()).unwrap();
        let response = redirect_response(&req, "8443");
        assert_eq!(
            response.headers().get(http::header::LOCATION).unwrap(),
            "https://localhost:8443/"
        );
    }
}
