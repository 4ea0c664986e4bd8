//! The write-once response sink
//!
//! A response is a status line followed by raw body bytes. The writer starts
//! in `AwaitingStatus`; the first `status` call writes the line and moves it
//! to `Streaming`. Afterwards only body bytes may be written, up to a
//! per-response cap.

use crate::error::ResponseError;
use crate::metrics::RequestMetrics;
use crate::status::Status;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Default cap on body bytes for a single response (4 MiB)
pub const DEFAULT_BODY_LIMIT: u64 = 4 * 1024 * 1024;

/// Longest meta string sent on a status line
pub const MAX_META_LEN: usize = 1024;

/// Boxed byte sink the response is written to
pub type Sink = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    AwaitingStatus,
    Streaming { status: Status },
}

/// Response half of a connection
pub struct ResponseWriter {
    inner: Sink,
    state: ResponseState,
    body_limit: u64,
    body_written: u64,
    host: String,
    metrics: Option<Arc<RequestMetrics>>,
}

impl ResponseWriter {
    pub fn new<W>(inner: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Box::new(inner),
            state: ResponseState::AwaitingStatus,
            body_limit: DEFAULT_BODY_LIMIT,
            body_written: 0,
            host: String::new(),
            metrics: None,
        }
    }

    pub fn with_body_limit(mut self, limit: u64) -> Self {
        self.body_limit = limit;
        self
    }

    /// Count every status emitted by this writer under `host`
    pub fn with_metrics(mut self, host: impl Into<String>, metrics: Arc<RequestMetrics>) -> Self {
        self.host = host.into();
        self.metrics = Some(metrics);
        self
    }

    /// Status sent so far, if any
    pub fn status_sent(&self) -> Option<Status> {
        match self.state {
            ResponseState::AwaitingStatus => None,
            ResponseState::Streaming { status } => Some(status),
        }
    }

    pub fn body_limit(&self) -> u64 {
        self.body_limit
    }

    pub fn body_written(&self) -> u64 {
        self.body_written
    }

    /// Send the status line; allowed exactly once per response
    pub async fn status(&mut self, status: Status, meta: &str) -> Result<(), ResponseError> {
        if let ResponseState::Streaming { status: sent } = self.state {
            return Err(ResponseError::StatusAlreadySent {
                sent,
                attempted: status,
            });
        }

        // The state flips before the write so a failed write can't be retried
        // into a second status line.
        self.state = ResponseState::Streaming { status };
        if let Some(metrics) = &self.metrics {
            metrics.record(&self.host, status);
        }

        let line = format!("{} {}\r\n", status, sanitize_meta(meta));
        self.inner.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Write body bytes, all or nothing with respect to the body cap
    pub async fn write_body(&mut self, bytes: &[u8]) -> Result<(), ResponseError> {
        if self.status_sent().is_none() {
            return Err(ResponseError::StatusNotSent);
        }
        if self.body_written + bytes.len() as u64 > self.body_limit {
            return Err(ResponseError::BodyLimitExceeded {
                limit: self.body_limit,
            });
        }
        self.write_all(bytes).await?;
        Ok(())
    }

    /// Flush and close the write side of the connection
    pub async fn finish(&mut self) -> Result<(), ResponseError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Keep meta on one line and within the protocol's length cap
fn sanitize_meta(meta: &str) -> String {
    let mut end = meta.len().min(MAX_META_LEN);
    while !meta.is_char_boundary(end) {
        end -= 1;
    }
    meta[..end].replace(['\r', '\n'], " ")
}

fn contract_error(error: ResponseError) -> io::Error {
    io::Error::other(error)
}

impl AsyncWrite for ResponseWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.status_sent().is_none() {
            return Poll::Ready(Err(contract_error(ResponseError::StatusNotSent)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let remaining = self.body_limit - self.body_written;
        if remaining == 0 {
            let limit = self.body_limit;
            return Poll::Ready(Err(contract_error(ResponseError::BodyLimitExceeded { limit })));
        }
        let allowed = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));

        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]) {
            Poll::Ready(Ok(n)) => {
                this.body_written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
