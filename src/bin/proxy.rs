//! Veil Proxy server
//!
//! A forward/reverse HTTP(S) proxy that:
//! - Forwards transparently or to a fixed upstream
//! - Bounds concurrency with an optional worker pool
//! - Rotates its own self-signed TLS identity without downtime
//! - Optionally obfuscates forwarded bodies on the wire

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use veil_proxy::auth::{AuthMethod, BasicAuth, NoAuth, TokenAuth};
use veil_proxy::config::Config;
use veil_proxy::obfuscation::Obfuscator;
use veil_proxy::proxy::{Mode, ProxyCore, ProxyService, WorkerPoolConfig};
use veil_proxy::server::Server;
use veil_proxy::tls::{CertManager, CertificateConfig};

/// Veil Proxy - forward/reverse HTTP(S) proxy with obfuscation
#[derive(Parser, Debug)]
#[command(name = "veil-proxy")]
#[command(about = "Forward/reverse HTTP(S) proxy with rotating TLS identity and traffic obfuscation")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Target URL for target-specific mode (e.g. http://10.10.10.80)
    #[arg(short, long)]
    target: Option<String>,

    /// Run in transparent mode
    #[arg(long)]
    transparent: bool,

    /// Static header appended to every outbound request ("Name: value")
    #[arg(long)]
    header: Option<String>,

    /// Per-request response timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Enable traffic obfuscation
    #[arg(long)]
    obfuscate: bool,

    /// Worker pool size (0 = no pool)
    #[arg(long)]
    workers: Option<usize>,

    /// Worker pool queue capacity
    #[arg(long)]
    queue: Option<usize>,

    /// Disable the plaintext listener
    #[arg(long)]
    no_http: bool,

    /// Enable the TLS listener
    #[arg(long)]
    https: bool,

    /// Redirect plaintext requests to the TLS listener
    #[arg(long)]
    redirect: bool,

    /// Plaintext listen address
    #[arg(long)]
    listen_http: Option<String>,

    /// TLS listen address
    #[arg(long)]
    listen_https: Option<String>,

    /// Certificate PEM path
    #[arg(long)]
    cert: Option<String>,

    /// Private key PEM path
    #[arg(long)]
    key: Option<String>,

    /// Certificate rotation interval in days
    #[arg(long)]
    rotation_interval: Option<u64>,

    /// Skip upstream certificate verification (development only)
    #[arg(long)]
    insecure_upstream: bool,

    /// Authentication method (none, token, basic)
    #[arg(long)]
    auth_method: Option<String>,

    /// Comma-separated list of valid tokens (token auth)
    #[arg(long)]
    auth_tokens: Option<String>,

    /// Username (basic auth)
    #[arg(long)]
    auth_username: Option<String>,

    /// Password (basic auth)
    #[arg(long)]
    auth_password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    // File config first, flags override
    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args)?;

    // Exactly one mode
    let mode = match (&config.proxy.target, args.transparent) {
        (Some(target), false) => {
            let uri = target
                .parse::<http::Uri>()
                .with_context(|| format!("Invalid target URL: {}", target))?;
            if uri.authority().is_none() {
                bail!("Target URL has no host: {}", target);
            }
            Mode::Fixed(uri)
        }
        (None, true) => Mode::Transparent,
        (None, false) => bail!("You must specify either --target <url> or --transparent"),
        (Some(_), true) => bail!("You cannot specify both --target and --transparent"),
    };

    info!("Veil Proxy v{}", veil_proxy::VERSION);

    let mut listen_addrs = Vec::new();
    if config.server.enable_http {
        listen_addrs.push(config.server.http_listen.clone());
    }
    if config.server.enable_https {
        listen_addrs.push(config.server.https_listen.clone());
    }
    if listen_addrs.is_empty() {
        bail!("All listeners are disabled");
    }

    let mut core = ProxyCore::new(mode)
        .with_insecure_upstream(config.proxy.insecure_upstream)
        .with_listen_addrs(listen_addrs);

    if let Some(header) = &config.proxy.static_header {
        core = core.with_static_header(header.clone());
    }
    if config.proxy.obfuscation {
        let obfuscator = Obfuscator::new().context("Failed to initialize obfuscation keys")?;
        core = core.with_obfuscator(obfuscator);
        info!("traffic obfuscation enabled");
    }

    let response_timeout = Duration::from_secs(config.proxy.response_timeout_secs);
    let mut service = ProxyService::new(core, response_timeout);

    if let Some(auth) = build_auth(&config)? {
        service = service.with_auth(auth);
    }

    if config.proxy.workers > 0 {
        service.enable_worker_pool(WorkerPoolConfig {
            workers: config.proxy.workers,
            queue_capacity: config.proxy.queue_capacity,
        });
    }

    let mut server = Server::new(service)
        .with_redirect_to_https(config.server.redirect_to_https)
        .with_shutdown_deadline(Duration::from_secs(config.server.shutdown_deadline_secs));

    if config.server.enable_http {
        server = server.with_http(config.server.http_listen.clone());
    }

    if config.server.enable_https {
        let cert_config = CertificateConfig {
            common_name: config.tls.common_name.clone(),
            organization: config.tls.organization.clone(),
            country: config.tls.country.clone(),
            validity: Duration::from_secs(config.tls.validity_days * 24 * 60 * 60),
            ..CertificateConfig::default()
        };

        let manager = Arc::new(
            CertManager::new(&config.tls.cert_file, &config.tls.key_file, cert_config)
                .with_rotation_observer(Box::new(|_| info!("serving rotated TLS identity")))
                .with_error_observer(Box::new(|e| {
                    tracing::error!("certificate rotation error: {}", e)
                })),
        );

        if !std::path::Path::new(&config.tls.cert_file).exists() {
            info!("no persisted identity found, generating one");
            manager
                .generate_identity()
                .context("Failed to generate TLS identity")?;
        }

        server = server
            .with_https(config.server.https_listen.clone(), manager)
            .with_rotation_interval(Duration::from_secs(
                config.tls.rotation_interval_days * 24 * 60 * 60,
            ));
    }

    server.run().await.context("Server error")?;
    Ok(())
}

/// Apply command-line overrides on top of the file configuration
fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(target) = &args.target {
        config.proxy.target = Some(target.clone());
    }
    if let Some(header) = &args.header {
        config.proxy.static_header = Some(header.clone());
    }
    if let Some(timeout) = args.timeout {
        config.proxy.response_timeout_secs = timeout;
    }
    if args.obfuscate {
        config.proxy.obfuscation = true;
    }
    if args.insecure_upstream {
        config.proxy.insecure_upstream = true;
    }
    if let Some(workers) = args.workers {
        config.proxy.workers = workers;
    }
    if let Some(queue) = args.queue {
        config.proxy.queue_capacity = queue;
    }

    if args.no_http {
        config.server.enable_http = false;
    }
    if args.https {
        config.server.enable_https = true;
    }
    if args.redirect {
        config.server.redirect_to_https = true;
    }
    if let Some(addr) = &args.listen_http {
        config.server.http_listen = addr.clone();
    }
    if let Some(addr) = &args.listen_https {
        config.server.https_listen = addr.clone();
    }

    if let Some(cert) = &args.cert {
        config.tls.cert_file = cert.clone();
    }
    if let Some(key) = &args.key {
        config.tls.key_file = key.clone();
    }
    if let Some(days) = args.rotation_interval {
        config.tls.rotation_interval_days = days;
    }

    if let Some(method) = &args.auth_method {
        config.auth.method = method.clone();
    }
    if let Some(tokens) = &args.auth_tokens {
        config.auth.tokens = tokens.split(',').map(str::to_string).collect();
    }
    if let Some(username) = &args.auth_username {
        config.auth.username = username.clone();
    }
    if let Some(password) = &args.auth_password {
        config.auth.password = password.clone();
    }

    Ok(())
}

/// Build the configured authentication method
fn build_auth(config: &Config) -> Result<Option<Arc<dyn AuthMethod>>> {
    match config.auth.method.as_str() {
        "none" => Ok(Some(Arc::new(NoAuth))),
        "token" => {
            if config.auth.tokens.is_empty() {
                bail!("No tokens provided for token-based authentication");
            }
            Ok(Some(Arc::new(TokenAuth::new(config.auth.tokens.clone()))))
        }
        "basic" => {
            if config.auth.username.is_empty() || config.auth.password.is_empty() {
                bail!("Username and password are required for basic authentication");
            }
            Ok(Some(Arc::new(BasicAuth::new(
                config.auth.username.clone(),
                config.auth.password.clone(),
            ))))
        }
        other => bail!("Invalid authentication method: {}", other),
    }
}
