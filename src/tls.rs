//! TLS setup: per-site certificates chosen by SNI, optional client
//! certificates, and the unverified client used towards upstreams

use crate::config::SiteConfig;
use crate::request::ClientCertificate;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e)
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e)
        })?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path.display())
}

/// Certificate chain and signing key for one site
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key from {}: {}", key_path.display(), e))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Picks the site certificate named by SNI
///
/// Handshakes without SNI, or naming a domain we have no certificate for, get
/// the first certificate added.
#[derive(Debug, Default)]
pub struct SniResolver {
    by_domain: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, domain: &str, key: Arc<CertifiedKey>) {
        if self.default.is_none() {
            self.default = Some(Arc::clone(&key));
        }
        self.by_domain.insert(domain.to_ascii_lowercase(), key);
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        server_name
            .and_then(|name| self.by_domain.get(&name.to_ascii_lowercase()))
            .or(self.default.as_ref())
            .cloned()
    }
}

/// Load the certificate of every configured site
pub fn load_site_certificates(sites: &[SiteConfig]) -> anyhow::Result<SniResolver> {
    let mut resolver = SniResolver::new();
    for site in sites {
        let key = load_certified_key(&site.cert_path, &site.key_path)
            .map_err(|e| anyhow::anyhow!("Site '{}': {}", site.domain, e))?;
        resolver.add(&site.domain, key);
    }
    Ok(resolver)
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        debug!(sni = server_name.unwrap_or(""), "Selecting certificate");
        self.lookup(server_name)
    }
}

/// Requests a client certificate but accepts any, or none
///
/// Handshake signatures are still checked, so the peer holds the key for
/// whatever certificate it presents.
#[derive(Debug)]
pub struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyClientCert {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Trusts every server certificate; upstreams sit on a trusted network
#[derive(Debug)]
pub struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server side TLS for every site, with client certificates optional
pub fn acceptor(resolver: SniResolver) -> anyhow::Result<TlsAcceptor> {
    if resolver.is_empty() {
        anyhow::bail!("No site certificates loaded");
    }

    let provider = provider();
    let verifier = Arc::new(AcceptAnyClientCert::new(Arc::clone(&provider)));
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(resolver));

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client side TLS that skips certificate verification
pub fn insecure_connector() -> Result<TlsConnector, rustls::Error> {
    let provider = provider();
    let verifier = Arc::new(NoCertificateVerification::new(Arc::clone(&provider)));
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// First certificate the peer presented, if any
pub fn peer_certificate<IO>(stream: &tokio_rustls::server::TlsStream<IO>) -> Option<ClientCertificate> {
    stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| ClientCertificate::new(cert.clone().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn self_signed(domain: &str) -> (NamedTempFile, NamedTempFile) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (write_temp(&cert.pem()), write_temp(&key_pair.serialize_pem()))
    }

    #[test]
    fn test_load_certified_key() {
        let (cert, key) = self_signed("a.example");
        let certified = load_certified_key(cert.path(), key.path()).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let missing = Path::new("/nonexistent/gemgate/cert.pem");
        let err = load_certs(missing).unwrap_err().to_string();
        assert!(err.contains("/nonexistent/gemgate/cert.pem"), "{}", err);

        let empty = write_temp("");
        let err = load_certs(empty.path()).unwrap_err().to_string();
        assert!(err.contains("No certificates found"), "{}", err);

        let (cert, _key) = self_signed("a.example");
        let err = load_key(cert.path()).unwrap_err().to_string();
        assert!(err.contains("No private key found"), "{}", err);
    }

    #[test]
    fn test_resolver_falls_back_to_first_site() {
        let (cert_a, key_a) = self_signed("a.example");
        let (cert_b, key_b) = self_signed("b.example");
        let a = load_certified_key(cert_a.path(), key_a.path()).unwrap();
        let b = load_certified_key(cert_b.path(), key_b.path()).unwrap();

        let mut resolver = SniResolver::new();
        resolver.add("a.example", Arc::clone(&a));
        resolver.add("B.example", Arc::clone(&b));
        assert_eq!(resolver.len(), 2);

        assert!(Arc::ptr_eq(&resolver.lookup(Some("b.example")).unwrap(), &b));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("A.EXAMPLE")).unwrap(), &a));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("c.example")).unwrap(), &a));
        assert!(Arc::ptr_eq(&resolver.lookup(None).unwrap(), &a));
    }

    #[test]
    fn test_acceptor_requires_a_certificate() {
        assert!(acceptor(SniResolver::new()).is_err());

        let (cert, key) = self_signed("a.example");
        let mut resolver = SniResolver::new();
        resolver.add("a.example", load_certified_key(cert.path(), key.path()).unwrap());
        assert!(acceptor(resolver).is_ok());
    }

    #[test]
    fn test_insecure_connector_builds() {
        assert!(insecure_connector().is_ok());
    }
}
