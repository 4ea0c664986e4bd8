//! Shared helpers for the integration tests

#![allow(dead_code)]

use gemgate::metrics::RequestMetrics;
use gemgate::server::{GeminiServer, Limits};
use gemgate::site::VirtualHosts;
use gemgate::tls::{self, SniResolver};
use rustls::pki_types::{CertificateDer, ServerName};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

/// Self-signed certificate written out as PEM files
pub struct TestCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub der: CertificateDer<'static>,
}

pub fn self_signed(dir: &TempDir, domain: &str) -> TestCert {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();

    let cert_path = dir.path().join(format!("{}.crt", domain));
    let key_path = dir.path().join(format!("{}.key", domain));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    TestCert {
        cert_path,
        key_path,
        der: cert.der().clone(),
    }
}

/// TLS acceptor presenting a fresh certificate for each of `domains`
pub fn acceptor_for(dir: &TempDir, domains: &[&str]) -> (TlsAcceptor, Vec<TestCert>) {
    let mut resolver = SniResolver::new();
    let mut certs = Vec::new();
    for domain in domains {
        let cert = self_signed(dir, domain);
        resolver.add(
            domain,
            tls::load_certified_key(&cert.cert_path, &cert.key_path).unwrap(),
        );
        certs.push(cert);
    }
    (tls::acceptor(resolver).unwrap(), certs)
}

pub struct RunningServer {
    pub addr: SocketAddr,
    pub metrics: Arc<RequestMetrics>,
    pub certs: Vec<TestCert>,
    shutdown_tx: watch::Sender<bool>,
    _dir: TempDir,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Start a gemini server on an ephemeral port
pub async fn start_server(hosts: VirtualHosts, domains: &[&str], limits: Limits) -> RunningServer {
    let dir = tempfile::tempdir().unwrap();
    let (acceptor, certs) = acceptor_for(&dir, domains);
    let metrics = Arc::new(RequestMetrics::new().unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GeminiServer::new(Arc::new(hosts), acceptor, Arc::clone(&metrics), shutdown_rx)
        .with_limits(limits);
    tokio::spawn(server.serve(listener));

    RunningServer {
        addr,
        metrics,
        certs,
        shutdown_tx,
        _dir: dir,
    }
}

/// Send `request` (terminator included) over TLS and read the whole response
pub async fn gemini_raw(addr: SocketAddr, sni: &str, request: &[u8]) -> Vec<u8> {
    let (response, _) = gemini_with_cert(addr, sni, request).await;
    response
}

/// Like `gemini_raw`, also returning the certificate the server presented
pub async fn gemini_with_cert(
    addr: SocketAddr,
    sni: &str,
    request: &[u8],
) -> (Vec<u8>, CertificateDer<'static>) {
    let connector = tls::insecure_connector().unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from(sni.to_string()).unwrap();
    let mut stream = connector.connect(name, tcp).await.unwrap();

    let presented = stream.get_ref().1.peer_certificates().unwrap()[0].clone();

    stream.write_all(request).await.unwrap();
    stream.flush().await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    (response, presented)
}

pub async fn gemini(addr: SocketAddr, sni: &str, url: &str) -> String {
    let response = gemini_raw(addr, sni, format!("{}\r\n", url).as_bytes()).await;
    String::from_utf8(response).unwrap()
}
