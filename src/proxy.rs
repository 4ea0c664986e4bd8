//! Reverse proxy to upstream Gemini servers
//!
//! Each request goes to one upstream picked at random. The request line is
//! rewritten to the presentation domain, the upstream status line is checked
//! and re-emitted, then the body is relayed byte for byte. One deadline covers
//! the whole exchange.

use crate::error::{ConfigError, ResponseError};
use crate::request::Request;
use crate::response::{ResponseWriter, MAX_META_LEN};
use crate::status::Status;
use rand::Rng;
use rustls::pki_types::ServerName;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Deadline for a whole upstream exchange
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Status code, separator, meta and CRLF
const MAX_STATUS_LINE: u64 = 2 + 1 + MAX_META_LEN as u64 + 2;

/// Where an upstream lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// `tcp://host:port`
    Tcp(String),
    /// `tls://host:port`, certificate not verified
    Tls(String),
    /// `unix:///path/to/socket`
    Unix(PathBuf),
}

impl Upstream {
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUpstream {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if rest.is_empty() {
            return Err(invalid("missing address"));
        }

        match scheme {
            "tcp" | "tls" | "tls-no-verify" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("expected host:port"))?;
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(invalid("expected host:port"));
                }
                if scheme == "tcp" {
                    Ok(Upstream::Tcp(rest.to_string()))
                } else {
                    Ok(Upstream::Tls(rest.to_string()))
                }
            }
            "unix" => {
                let path = if rest.starts_with('/') {
                    PathBuf::from(rest)
                } else {
                    PathBuf::from("/").join(rest)
                };
                Ok(Upstream::Unix(path))
            }
            _ => Err(invalid("unknown scheme")),
        }
    }

    /// Host part of a network address, for use as a TLS name
    fn host(&self) -> Option<&str> {
        match self {
            Upstream::Tcp(addr) | Upstream::Tls(addr) => addr
                .rsplit_once(':')
                .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']')),
            Upstream::Unix(_) => None,
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Tcp(addr) => write!(f, "tcp://{}", addr),
            Upstream::Tls(addr) => write!(f, "tls://{}", addr),
            Upstream::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamStream for T {}

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("malformed status line from upstream: {0}")]
    Malformed(&'static str),
}

/// Forwards requests for one presentation domain
#[derive(Clone)]
pub struct ReverseProxy {
    upstreams: Vec<Upstream>,
    domain: String,
    connector: TlsConnector,
    timeout: Duration,
}

impl ReverseProxy {
    pub fn new(
        upstreams: Vec<Upstream>,
        domain: impl Into<String>,
        connector: TlsConnector,
    ) -> Result<Self, ConfigError> {
        if upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        Ok(Self {
            upstreams,
            domain: domain.into(),
            connector,
            timeout: DEFAULT_PROXY_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    fn choose(&self) -> &Upstream {
        let index = rand::thread_rng().gen_range(0..self.upstreams.len());
        &self.upstreams[index]
    }

    pub async fn serve(&self, req: &mut Request, w: &mut ResponseWriter) -> Result<(), ResponseError> {
        let upstream = self.choose();
        let deadline = Instant::now() + self.timeout;

        if let Err(e) = req.set_host(&self.domain) {
            warn!(domain = %self.domain, error = %e, "Can't rewrite request host");
            return w
                .status(Status::PROXY_ERROR, &format!("can't address {}: {}", self.domain, e))
                .await;
        }

        debug!(upstream = %upstream, url = %req, "Forwarding request");

        let (mut reader, status, meta) = match timeout_at(deadline, self.exchange(upstream, req)).await {
            Ok(Ok(exchange)) => exchange,
            Ok(Err(UpstreamError::Io(e))) => {
                warn!(upstream = %upstream, error = %e, "Upstream failed");
                return w
                    .status(Status::PROXY_ERROR, &format!("upstream {}: {}", upstream, e))
                    .await;
            }
            Ok(Err(e @ UpstreamError::Malformed(_))) => {
                warn!(upstream = %upstream, error = %e, "Upstream response rejected");
                return w.status(Status::TEMPORARY_FAILURE, &e.to_string()).await;
            }
            Err(_) => {
                warn!(upstream = %upstream, timeout_secs = self.timeout.as_secs(), "Upstream timed out");
                return w.status(Status::PROXY_ERROR, "upstream timed out").await;
            }
        };

        w.status(status, &meta).await?;

        match timeout_at(deadline, tokio::io::copy(&mut reader, w)).await {
            Ok(Ok(bytes)) => debug!(upstream = %upstream, %status, bytes, "Upstream response relayed"),
            Ok(Err(e)) => warn!(upstream = %upstream, error = %e, "Upstream relay cut short"),
            Err(_) => warn!(upstream = %upstream, "Upstream relay timed out"),
        }
        Ok(())
    }

    /// Connect, send the request line and read back the status line
    async fn exchange(
        &self,
        upstream: &Upstream,
        req: &Request,
    ) -> Result<(BufReader<Box<dyn UpstreamStream>>, Status, String), UpstreamError> {
        let mut conn = self.connect(upstream).await?;
        conn.write_all(format!("{}\r\n", req).as_bytes()).await?;
        conn.flush().await?;

        let mut reader = BufReader::new(conn);
        let (status, meta) = read_status_line(&mut reader).await?;
        Ok((reader, status, meta))
    }

    async fn connect(&self, upstream: &Upstream) -> io::Result<Box<dyn UpstreamStream>> {
        match upstream {
            Upstream::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr.as_str()).await?)),
            Upstream::Tls(addr) => {
                let server_name = self.server_name(upstream)?;
                let tcp = TcpStream::connect(addr.as_str()).await?;
                Ok(Box::new(self.connector.connect(server_name, tcp).await?))
            }
            #[cfg(unix)]
            Upstream::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Upstream::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }

    /// SNI name: the presentation domain, else the upstream's own host
    fn server_name(&self, upstream: &Upstream) -> io::Result<ServerName<'static>> {
        ServerName::try_from(self.domain.clone())
            .ok()
            .or_else(|| {
                upstream
                    .host()
                    .and_then(|host| ServerName::try_from(host.to_string()).ok())
            })
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no usable TLS name for {}", upstream),
                )
            })
    }
}

async fn read_status_line<R>(reader: &mut R) -> Result<(Status, String), UpstreamError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_STATUS_LINE)
        .read_until(b'\n', &mut line)
        .await?;

    if read == 0 {
        return Err(UpstreamError::Malformed("empty response"));
    }
    if line.pop() != Some(b'\n') {
        return Err(UpstreamError::Malformed("missing line terminator"));
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    let text = String::from_utf8(line).map_err(|_| UpstreamError::Malformed("not UTF-8"))?;
    let (code, meta) = text
        .split_once(' ')
        .ok_or(UpstreamError::Malformed("missing separator"))?;
    let status = Status::parse(code).ok_or(UpstreamError::Malformed("invalid status code"))?;

    Ok((status, meta.to_string()))
}
