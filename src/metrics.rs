//! Request counters and the HTTP endpoint that exposes them

use crate::status::Status;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const REQUESTS_METRIC: &str = "gemini_requests_total";

/// Counts emitted status lines per (domain, status)
///
/// The counters live on a registry owned by this value rather than the
/// process-wide default one.
#[derive(Clone)]
pub struct RequestMetrics {
    registry: Registry,
    requests: IntCounterVec,
}

impl RequestMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the request counter on `registry`, which `render` then gathers
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(REQUESTS_METRIC, "The number of gemini requests handled"),
            &["domain", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        Ok(Self { registry, requests })
    }

    pub fn record(&self, host: &str, status: Status) {
        let code = status.to_string();
        self.requests.with_label_values(&[host, code.as_str()]).inc();
    }

    pub fn count(&self, host: &str, status: Status) -> u64 {
        let code = status.to_string();
        self.requests.with_label_values(&[host, code.as_str()]).get()
    }

    /// Everything on the registry in the Prometheus text exposition format
    pub fn render(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for RequestMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMetrics").finish_non_exhaustive()
    }
}

fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Plain HTTP server for instrumentation
pub struct MetricsServer {
    bind_addr: SocketAddr,
    metrics: Arc<RequestMetrics>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetricsServer {
    pub fn new(
        bind_addr: SocketAddr,
        metrics: Arc<RequestMetrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            metrics,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Metrics server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let metrics = Arc::clone(&self.metrics);
                            tokio::spawn(async move {
                                if let Err(e) = serve_metrics_connection(stream, metrics).await {
                                    debug!(addr = %addr, error = %e, "Metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept metrics connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Metrics server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_metrics_connection<S>(stream: S, metrics: Arc<RequestMetrics>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let metrics = Arc::clone(&metrics);
        async move { handle_metrics_request(req, metrics).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Metrics connection error: {}", e))?;

    Ok(())
}

async fn handle_metrics_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<RequestMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Metrics request");

    let response = match (method, path) {
        (&Method::GET, "/metrics") => match metrics.render() {
            Ok(body) => response(StatusCode::OK, prometheus::TEXT_FORMAT, body),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "metrics unavailable")
            }
        },
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            response(StatusCode::OK, "application/json", version_info.to_string())
        }
        _ => response(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };

    Ok(response)
}
