//! The Gemini listener: TLS accept, request framing, dispatch

use crate::config::ServerConfig;
use crate::error::RequestError;
use crate::metrics::RequestMetrics;
use crate::request::{ClientCertificate, Request};
use crate::response::{ResponseWriter, DEFAULT_BODY_LIMIT};
use crate::site::VirtualHosts;
use crate::status::Status;
use crate::tls;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Longest request URL accepted, not counting the line terminator
pub const MAX_REQUEST_LINE: usize = 1024;

/// Metrics label for requests that name no configured site
pub const UNKNOWN_HOST_LABEL: &str = "";

/// Per-connection deadlines and caps
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub max_response_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_response_bytes: DEFAULT_BODY_LIMIT,
        }
    }
}

impl From<&ServerConfig> for Limits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            request_timeout: config.request_timeout(),
            max_response_bytes: config.max_response_bytes,
        }
    }
}

/// Accepts TLS connections and answers one request on each
pub struct GeminiServer {
    hosts: Arc<VirtualHosts>,
    acceptor: TlsAcceptor,
    metrics: Arc<RequestMetrics>,
    shutdown_rx: watch::Receiver<bool>,
    limits: Limits,
}

impl GeminiServer {
    pub fn new(
        hosts: Arc<VirtualHosts>,
        acceptor: TlsAcceptor,
        metrics: Arc<RequestMetrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            hosts,
            acceptor,
            metrics,
            shutdown_rx,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Serve on an already bound listener until shutdown is signaled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, sites = self.hosts.len(), "Gemini server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let hosts = Arc::clone(&self.hosts);
                            let metrics = Arc::clone(&self.metrics);
                            let acceptor = self.acceptor.clone();
                            let limits = self.limits;

                            let span = info_span!("connection", request_id = %Uuid::new_v4(), peer_addr = %addr);
                            tokio::spawn(
                                async move {
                                    let tls_stream = match timeout(limits.handshake_timeout, acceptor.accept(stream)).await {
                                        Ok(Ok(tls_stream)) => tls_stream,
                                        Ok(Err(e)) => {
                                            debug!(error = %e, "TLS handshake failed");
                                            return;
                                        }
                                        Err(_) => {
                                            debug!("TLS handshake timed out");
                                            return;
                                        }
                                    };
                                    let certificate = tls::peer_certificate(&tls_stream);
                                    handle_connection(tls_stream, addr, certificate, &hosts, &metrics, limits).await;
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gemini server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Answer the single request carried by `stream`, then close it
pub async fn handle_connection<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    certificate: Option<ClientCertificate>,
    hosts: &VirtualHosts,
    metrics: &Arc<RequestMetrics>,
    limits: Limits,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let parsed = match timeout(limits.request_timeout, read_request_line(&mut stream)).await {
        Ok(line) => line.and_then(|line| Request::parse(&line)),
        Err(_) => Err(RequestError::Timeout(limits.request_timeout)),
    };
    let writer = ResponseWriter::new(stream).with_body_limit(limits.max_response_bytes);

    let mut req = match parsed {
        Ok(req) => req.with_certificate(certificate),
        Err(e) => {
            debug!(%peer_addr, error = %e, "Rejected request");
            let mut w = writer.with_metrics(UNKNOWN_HOST_LABEL, Arc::clone(metrics));
            if let Err(e) = w.status(e.status(), &e.meta()).await {
                debug!(error = %e, "Failed to send status");
            }
            if let Err(e) = w.finish().await {
                debug!(error = %e, "Failed to close connection");
            }
            return;
        }
    };

    let host = req.host().to_string();
    let path = req.path().to_string();
    debug!(
        %host,
        %path,
        client_cert = ?req.certificate().map(ClientCertificate::fingerprint),
        "Incoming request"
    );

    // Hosts without a site share one label.
    let label = if hosts.find(&host).is_some() { host.as_str() } else { UNKNOWN_HOST_LABEL };
    let mut w = writer.with_metrics(label, Arc::clone(metrics));
    match hosts.serve(&mut req, &mut w).await {
        Ok(()) => {}
        Err(e) if e.is_contract_violation() => {
            error!(%host, %path, error = %e, "Handler broke the response contract");
        }
        Err(e) => debug!(%host, %path, error = %e, "Response aborted"),
    }

    finish_response(&mut w).await;

    if let Some(status) = w.status_sent() {
        info!(
            %host,
            %path,
            %status,
            category = ?status.category(),
            bytes = w.body_written(),
            "Request served"
        );
    }
}

/// Answer 40 if the handler returned without a status, then close
async fn finish_response(w: &mut ResponseWriter) {
    if w.status_sent().is_none() {
        if let Err(e) = w
            .status(Status::TEMPORARY_FAILURE, "handler produced no response")
            .await
        {
            debug!(error = %e, "Failed to send fallback status");
        }
    }
    if let Err(e) = w.finish().await {
        debug!(error = %e, "Failed to close connection");
    }
}

/// Read one line of at most `MAX_REQUEST_LINE` bytes plus CRLF; a bare LF
/// also ends the line
async fn read_request_line<R>(reader: R) -> Result<String, RequestError>
where
    R: AsyncRead + Unpin,
{
    let limit = MAX_REQUEST_LINE + 2;
    let mut reader = BufReader::new(reader).take(limit as u64);
    let mut line = Vec::with_capacity(256);
    reader.read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') {
        if line.len() >= limit {
            return Err(RequestError::LineTooLong { limit: MAX_REQUEST_LINE });
        }
        return Err(RequestError::MissingTerminator);
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > MAX_REQUEST_LINE {
        return Err(RequestError::LineTooLong { limit: MAX_REQUEST_LINE });
    }

    String::from_utf8(line).map_err(|_| RequestError::InvalidUtf8)
}
