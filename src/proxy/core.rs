//! Proxy core
//!
//! Turns one inbound request into one forwarded request and one transformed
//! response, honoring mode, timeout and obfuscation policy. Dispatch is
//! always a race between the forward and its deadline; the worker pool, when
//! enabled, bounds how many forwards are in flight at once.

use super::{request, response, status_response, ProxyError, WorkerPool, WorkerPoolConfig};
use crate::auth::{self, AuthMethod};
use crate::obfuscation::Obfuscator;
use crate::tls;
use bytes::Bytes;
use http::header::HOST;
use http::request::Parts;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Destination selection policy, fixed at construction
#[derive(Debug, Clone)]
pub enum Mode {
    /// Derive the destination from each inbound request's host
    Transparent,
    /// Forward every request to one fixed upstream
    Fixed(Uri),
}

/// The forwarding engine: resolves destinations, builds transports and runs
/// the transform pipeline
pub struct ProxyCore {
    mode: Mode,
    static_header: Option<String>,
    connect_timeout: Duration,
    idle_timeout: Duration,
    obfuscator: Option<Obfuscator>,
    insecure_upstream: bool,
    listen_addrs: Vec<String>,
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("mode", &self.mode)
            .field("obfuscation", &self.obfuscator.is_some())
            .finish_non_exhaustive()
    }
}

impl ProxyCore {
    /// Create a forwarding core for the given mode
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            static_header: None,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            obfuscator: None,
            insecure_upstream: false,
            listen_addrs: Vec::new(),
        }
    }

    /// Append this `Name: value` header to every outbound request
    pub fn with_static_header(mut self, header: impl Into<String>) -> Self {
        self.static_header = Some(header.into());
        self
    }

    /// Enable traffic obfuscation with the given codec
    pub fn with_obfuscator(mut self, obfuscator: Obfuscator) -> Self {
        self.obfuscator = Some(obfuscator);
        self
    }

    /// Skip upstream certificate verification (development only)
    pub fn with_insecure_upstream(mut self, insecure: bool) -> Self {
        self.insecure_upstream = insecure;
        self
    }

    /// Addresses this proxy listens on, used by the self-loop guard
    pub fn with_listen_addrs(mut self, addrs: Vec<String>) -> Self {
        self.listen_addrs = addrs;
        self
    }

    /// Override the upstream connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the idle-connection timeout of the forwarding transport
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Resolve where this request forwards to
    pub fn resolve_destination(&self, parts: &Parts, via_tls: bool) -> Result<Uri, ProxyError> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        match &self.mode {
            Mode::Fixed(target) => {
                let authority = target
                    .authority()
                    .ok_or_else(|| ProxyError::InvalidDestination(target.to_string()))?;
                Uri::builder()
                    .scheme(target.scheme_str().unwrap_or("http"))
                    .authority(authority.as_str())
                    .path_and_query(path_and_query)
                    .build()
                    .map_err(ProxyError::Http)
            }
            Mode::Transparent => {
                let host = parts
                    .uri
                    .authority()
                    .map(|a| a.as_str().to_string())
                    .or_else(|| {
                        parts
                            .headers
                            .get(HOST)
                            .and_then(|h| h.to_str().ok())
                            .map(str::to_string)
                    })
                    .filter(|h| !h.is_empty())
                    .ok_or(ProxyError::MissingDestination)?;

                if self.is_self_loop(&host) {
                    return Err(ProxyError::SelfLoop(host));
                }

                let scheme = if via_tls { "https" } else { "http" };
                Uri::builder()
                    .scheme(scheme)
                    .authority(host)
                    .path_and_query(path_and_query)
                    .build()
                    .map_err(ProxyError::Http)
            }
        }
    }

    /// Whether a destination host points back at one of our own listeners
    fn is_self_loop(&self, host: &str) -> bool {
        for addr in &self.listen_addrs {
            if host == addr {
                return true;
            }
            // Loopback aliases on the same port count as ourselves
            if let (Some((listen_host, listen_port)), Some((dest_host, dest_port))) =
                (addr.rsplit_once(':'), host.rsplit_once(':'))
            {
                if listen_port == dest_port
                    && (dest_host == listen_host
                        || dest_host == "localhost"
                        || dest_host == "127.0.0.1"
                        || dest_host == "[::1]")
                {
                    return true;
                }
            }
        }
        false
    }

    /// Build the short-lived forwarding transport for one exchange
    fn build_client(
        &self,
    ) -> Result<Client<HttpsConnector<HttpConnector>, Full<Bytes>>, ProxyError> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(self.connect_timeout));
        http.enforce_http(false);

        let tls_config = tls::upstream_client_config(self.insecure_upstream)?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        Ok(Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.idle_timeout)
            .build(https))
    }

    /// Forward one request: transform, exchange, transform back
    pub async fn forward(
        &self,
        req: Request<Bytes>,
        via_tls: bool,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        let destination = self.resolve_destination(&parts, via_tls)?;
        debug!("destination resolved: {}", destination);

        let body = request::transform(
            &mut parts,
            body,
            &destination,
            self.static_header.as_deref(),
            self.obfuscator.as_ref(),
        )?;

        let client = self.build_client()?;
        let outbound = Request::from_parts(parts, Full::new(body));

        let upstream_response = client
            .request(outbound)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        response::transform(upstream_response, self.obfuscator.as_ref()).await
    }
}

/// Per-request dispatcher wrapping the core with auth, timeout and the
/// optional worker pool
pub struct ProxyService {
    core: Arc<ProxyCore>,
    pool: Option<WorkerPool>,
    auth: Option<Arc<dyn AuthMethod>>,
    response_timeout: Duration,
}

impl ProxyService {
    /// Create a service dispatching directly (no worker pool)
    pub fn new(core: ProxyCore, response_timeout: Duration) -> Self {
        Self {
            core: Arc::new(core),
            pool: None,
            auth: None,
            response_timeout,
        }
    }

    /// Require authentication before forwarding
    pub fn with_auth(mut self, auth: Arc<dyn AuthMethod>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Dispatch through a bounded worker pool instead of spawning per
    /// request
    pub fn enable_worker_pool(&mut self, config: WorkerPoolConfig) {
        self.pool = Some(WorkerPool::start(config, Arc::clone(&self.core)));
    }

    /// The forwarding core backing this service
    pub fn core(&self) -> Arc<ProxyCore> {
        Arc::clone(&self.core)
    }

    /// Stop the worker pool, waiting for in-flight jobs
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.stop().await;
        }
    }

    /// Handle one inbound request end to end
    pub async fn handle<B>(&self, req: Request<B>, via_tls: bool) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();

        if let Some(method) = &self.auth {
            if !auth::check(method.as_ref(), &parts) {
                return status_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            }
        }

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("failed to read request body: {}", e);
                return status_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let req = Request::from_parts(parts, body);

        let result = match &self.pool {
            Some(pool) => pool.submit(req, via_tls, self.response_timeout).await,
            None => {
                tokio::select! {
                    result = self.core.forward(req, via_tls) => result,
                    _ = tokio::time::sleep(self.response_timeout) => Err(ProxyError::Timeout),
                }
            }
        };

        match result {
            Ok(response) => response,
            Err(e) => super::error_response(&e),
        }
    }
}
