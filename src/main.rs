use gemgate::config::{self, Config, CONFIG_ENV};
use gemgate::metrics::{MetricsServer, RequestMetrics, PKG_NAME, VERSION};
use gemgate::readiness;
use gemgate::server::{GeminiServer, Limits};
use gemgate::site::VirtualHosts;
use gemgate::tls;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gemgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = config::resolve_path(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(
        RequestMetrics::new().map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?,
    );

    let connector = tls::insecure_connector()
        .map_err(|e| anyhow::anyhow!("Failed to build upstream TLS client: {}", e))?;
    let hosts = Arc::new(VirtualHosts::from_config(&config, &connector)?);

    let resolver = tls::load_site_certificates(&config.sites)?;
    info!(certificates = resolver.len(), "Site certificates loaded");
    let acceptor = tls::acceptor(resolver)?;

    let gemini_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let listener = TcpListener::bind(gemini_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", gemini_addr, e))?;

    match readiness::notify_ready(hosts.len()) {
        Ok(true) => info!(sites = hosts.len(), "Readiness reported to service manager"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Failed to report readiness"),
    }

    // Spawn metrics server
    let metrics_handle = if config.server.metrics_enabled() {
        let metrics_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid metrics bind address: {}", e))?;
        let metrics_server = MetricsServer::new(metrics_addr, Arc::clone(&metrics), shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!(error = %e, "Metrics server error");
            }
        }))
    } else {
        None
    };

    // Spawn gemini server
    let gemini_server = GeminiServer::new(hosts, acceptor, metrics, shutdown_rx.clone())
        .with_limits(Limits::from(&config.server));
    let gemini_handle = tokio::spawn(async move {
        if let Err(e) = gemini_server.serve(listener).await {
            error!(error = %e, "Gemini server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C, shutting down...");
    }

    if let Err(e) = readiness::notify_stopping() {
        warn!(error = %e, "Failed to report shutdown");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gemini_handle.await;
        if let Some(handle) = metrics_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gemini server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        http_port = if config.server.metrics_enabled() { Some(config.server.http_port) } else { None },
        "Server configuration"
    );
    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        handshake_timeout_secs = config.server.handshake_timeout_secs,
        proxy_timeout_secs = config.server.proxy_timeout_secs,
        max_response_bytes = config.server.max_response_bytes,
        "Request handling limits"
    );
    for site in &config.sites {
        let handler = if site.files.is_some() {
            "files"
        } else if site.reverse_proxy.is_some() {
            "reverse_proxy"
        } else if site.routes.is_some() {
            "routes"
        } else {
            "none"
        };
        info!(domain = %site.domain, handler, "Site configured");
    }
}
