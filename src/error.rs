//! Error types for request framing, the response contract and setup

use crate::status::Status;
use std::time::Duration;
use thiserror::Error;

/// Failure to frame or parse the single request line
#[derive(Debug, Error)]
pub enum RequestError {
    /// No line terminator within the size cap
    #[error("request line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// Peer closed the stream before sending a line terminator
    #[error("connection closed before end of request line")]
    MissingTerminator,

    /// Peer did not finish the request line in time
    #[error("request line not received within {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("request is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid url: {0}")]
    UnsupportedUrl(&'static str),

    #[error("can't read request: {0}")]
    Io(#[from] std::io::Error),
}

impl RequestError {
    /// Status sent to the peer for this framing error
    pub fn status(&self) -> Status {
        Status::BAD_REQUEST
    }

    /// Meta text sent alongside the status
    pub fn meta(&self) -> String {
        match self {
            RequestError::Io(_) => "invalid request".to_string(),
            other => other.to_string(),
        }
    }
}

/// Violations of the write-once response contract, or a failed write
#[derive(Debug, Error)]
pub enum ResponseError {
    /// A second status line was attempted on the same response
    #[error("status {attempted} after status {sent} was already sent")]
    StatusAlreadySent { sent: Status, attempted: Status },

    /// Body bytes were written before any status line
    #[error("body written before status line")]
    StatusNotSent,

    /// The body grew past the per-response cap
    #[error("response body exceeds {limit} bytes")]
    BodyLimitExceeded { limit: u64 },

    #[error("write to peer failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ResponseError {
    /// Whether this error stems from a handler misusing the writer
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ResponseError::StatusAlreadySent { .. } | ResponseError::StatusNotSent
        )
    }
}

/// Setup-time errors: these never surface while serving
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid route pattern {0:?}")]
    InvalidPattern(String),

    #[error("multiple registrations for {0}")]
    DuplicateRoute(String),

    #[error("reverse proxy has no upstreams")]
    NoUpstreams,

    #[error("invalid upstream {address:?}: {reason}")]
    InvalidUpstream { address: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_errors_map_to_bad_request() {
        let errors = [
            RequestError::LineTooLong { limit: 1024 },
            RequestError::MissingTerminator,
            RequestError::Timeout(Duration::from_secs(10)),
            RequestError::InvalidUtf8,
            RequestError::UnsupportedUrl("relative reference"),
        ];
        for error in errors {
            assert_eq!(error.status(), Status::BAD_REQUEST);
        }
    }

    #[test]
    fn test_request_error_meta() {
        assert_eq!(
            RequestError::LineTooLong { limit: 1024 }.meta(),
            "request line exceeds 1024 bytes"
        );
        assert_eq!(
            RequestError::Timeout(Duration::from_secs(10)).meta(),
            "request line not received within 10 seconds"
        );
        let io = RequestError::Io(std::io::Error::other("reset"));
        assert_eq!(io.meta(), "invalid request");
    }

    #[test]
    fn test_contract_violations() {
        assert!(ResponseError::StatusNotSent.is_contract_violation());
        assert!(ResponseError::StatusAlreadySent {
            sent: Status::SUCCESS,
            attempted: Status::NOT_FOUND,
        }
        .is_contract_violation());
        assert!(!ResponseError::BodyLimitExceeded { limit: 10 }.is_contract_violation());
    }

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::DuplicateRoute("/docs/".to_string()).to_string(),
            "multiple registrations for /docs/"
        );
        assert_eq!(
            ConfigError::InvalidUpstream {
                address: "ftp://x".to_string(),
                reason: "unknown scheme".to_string(),
            }
            .to_string(),
            "invalid upstream \"ftp://x\": unknown scheme"
        );
    }
}
