//! The parsed Gemini request

use crate::error::RequestError;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Certificate presented by the client during the TLS handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    der: CertificateDer<'static>,
}

impl ClientCertificate {
    pub fn new(der: CertificateDer<'static>) -> Self {
        Self { der }
    }

    /// Lowercase hex SHA-256 of the DER encoding, the usual Gemini identity
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.der.as_ref()))
    }
}

/// One request, parsed from the request line of a connection
#[derive(Debug, Clone)]
pub struct Request {
    url: Url,
    certificate: Option<ClientCertificate>,
}

impl Request {
    /// Parse the request line (terminator already stripped)
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let mut url = Url::parse(line)?;
        if url.cannot_be_a_base() {
            return Err(RequestError::UnsupportedUrl("url has no path"));
        }
        if url.path().is_empty() {
            url.set_path("/");
        }
        Ok(Self {
            url,
            certificate: None,
        })
    }

    pub fn with_certificate(mut self, certificate: Option<ClientCertificate>) -> Self {
        self.certificate = certificate;
        self
    }

    /// Target host without any port; empty when the url names none
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    pub fn certificate(&self) -> Option<&ClientCertificate> {
        self.certificate.as_ref()
    }

    /// Present the request as addressed to `host`, dropping any explicit port
    pub fn set_host(&mut self, host: &str) -> Result<(), url::ParseError> {
        self.url.set_host(Some(host))?;
        self.url
            .set_port(None)
            .map_err(|()| url::ParseError::EmptyHost)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
