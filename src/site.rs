//! Virtual hosts: one handler per domain, chosen by the request host

use crate::config::{Config, FilesConfig, ReverseProxyConfig, SiteConfig};
use crate::error::{ConfigError, ResponseError};
use crate::files::FileServer;
use crate::handler::Handler;
use crate::proxy::{ReverseProxy, Upstream};
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::router::Router;
use crate::status::Status;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// A domain and whatever answers for it
#[derive(Debug)]
pub struct Site {
    domain: String,
    handler: Option<Handler>,
}

impl Site {
    pub fn new(domain: impl Into<String>, handler: Option<Handler>) -> Self {
        Self {
            domain: domain.into(),
            handler,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }
}

/// Every configured site, in match order
#[derive(Debug, Default)]
pub struct VirtualHosts {
    sites: Vec<Site>,
}

impl VirtualHosts {
    pub fn new(sites: Vec<Site>) -> Self {
        Self { sites }
    }

    /// Build handlers for every site in `config`
    pub fn from_config(config: &Config, connector: &TlsConnector) -> Result<Self, ConfigError> {
        let builder = HandlerBuilder {
            connector,
            proxy_timeout: config.server.proxy_timeout(),
        };
        let sites = config
            .sites
            .iter()
            .map(|site| Ok(Site::new(site.domain.clone(), builder.site(site)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { sites })
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    /// First site whose domain equals `host` exactly
    pub fn find(&self, host: &str) -> Option<&Site> {
        self.sites.iter().find(|site| site.domain == host)
    }

    pub async fn serve(&self, req: &mut Request, w: &mut ResponseWriter) -> Result<(), ResponseError> {
        let Some(site) = self.find(req.host()) else {
            debug!(host = req.host(), "No site for host");
            return w
                .status(
                    Status::PROXY_REQUEST_REFUSED,
                    &format!("can't proxy to {}", req.host()),
                )
                .await;
        };

        match &site.handler {
            Some(handler) => handler.serve(req, w).await,
            None => {
                w.status(Status::UNAVAILABLE, "no active configuration detected")
                    .await
            }
        }
    }
}

struct HandlerBuilder<'a> {
    connector: &'a TlsConnector,
    proxy_timeout: Duration,
}

impl HandlerBuilder<'_> {
    fn site(&self, site: &SiteConfig) -> Result<Option<Handler>, ConfigError> {
        if let Some(files) = &site.files {
            return Ok(Some(self.files(files)));
        }
        if let Some(proxy) = &site.reverse_proxy {
            return Ok(Some(self.proxy(proxy)?));
        }
        if let Some(routes) = &site.routes {
            let mut router = Router::new();
            for (pattern, route) in routes {
                if !pattern.starts_with('/') {
                    return Err(ConfigError::InvalidPattern(pattern.clone()));
                }
                let handler = match (&route.files, &route.reverse_proxy) {
                    (Some(files), None) => self.files(files),
                    (None, Some(proxy)) => self.proxy(proxy)?,
                    _ => return Err(ConfigError::InvalidPattern(pattern.clone())),
                };
                router.register(pattern.as_str(), handler)?;
            }
            return Ok(Some(Handler::Router(router)));
        }
        Ok(None)
    }

    fn files(&self, files: &FilesConfig) -> Handler {
        Handler::Files(
            FileServer::new(&files.root)
                .with_auto_index(files.auto_index)
                .with_user_paths(files.user_paths),
        )
    }

    fn proxy(&self, proxy: &ReverseProxyConfig) -> Result<Handler, ConfigError> {
        let upstreams = proxy
            .to
            .iter()
            .map(|address| Upstream::parse(address))
            .collect::<Result<Vec<_>, _>>()?;
        let proxy = ReverseProxy::new(upstreams, proxy.domain.clone(), self.connector.clone())?
            .with_timeout(self.proxy_timeout);
        Ok(Handler::Proxy(proxy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn respond(hosts: &VirtualHosts, url: &str) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut w = ResponseWriter::new(server);
        let mut req = Request::parse(url).unwrap();

        hosts.serve(&mut req, &mut w).await.unwrap();
        w.finish().await.unwrap();
        drop(w);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    fn hosts() -> VirtualHosts {
        let mut router = Router::new();
        router.register("/exact", Handler::NotFound).unwrap();
        VirtualHosts::new(vec![
            Site::new("a.example", Some(Handler::NotFound)),
            Site::new("b.example", Some(Handler::Router(router))),
            Site::new("c.example", None),
        ])
    }

    #[tokio::test]
    async fn test_dispatch_by_host() {
        let hosts = hosts();
        assert_eq!(
            respond(&hosts, "gemini://a.example/x").await,
            "51 /x not found\r\n"
        );
        assert_eq!(
            respond(&hosts, "gemini://b.example:1965/exact/").await,
            "51 /exact/ not found\r\n"
        );
    }

    #[tokio::test]
    async fn test_unknown_host_is_refused() {
        let out = respond(&hosts(), "gemini://evil.example/").await;
        assert_eq!(out, "53 can't proxy to evil.example\r\n");
    }

    #[tokio::test]
    async fn test_host_match_is_exact() {
        let out = respond(&hosts(), "gemini://www.a.example/").await;
        assert!(out.starts_with("53 "), "{}", out);
    }

    #[tokio::test]
    async fn test_site_without_handler() {
        let out = respond(&hosts(), "gemini://c.example/anything").await;
        assert_eq!(out, "41 no active configuration detected\r\n");
    }

    #[test]
    fn test_first_matching_site_wins() {
        let hosts = VirtualHosts::new(vec![
            Site::new("a.example", None),
            Site::new("a.example", Some(Handler::NotFound)),
        ]);
        assert!(hosts.find("a.example").unwrap().handler().is_none());
    }

    #[test]
    fn test_from_config() {
        let toml = r#"
[server]
proxy_timeout_secs = 5

[[sites]]
domain = "files.example"
cert_path = "c.pem"
key_path = "k.pem"
[sites.files]
root = "/srv/files"
auto_index = true

[[sites]]
domain = "proxy.example"
cert_path = "c.pem"
key_path = "k.pem"
[sites.reverse_proxy]
to = ["tcp://127.0.0.1:2000"]
domain = "capsule.example"

[[sites]]
domain = "routes.example"
cert_path = "c.pem"
key_path = "k.pem"
[sites.routes."/"]
files = { root = "/srv/root" }
[sites.routes."/app/"]
reverse_proxy = { to = ["unix:///run/app.sock"], domain = "routes.example" }

[[sites]]
domain = "idle.example"
cert_path = "c.pem"
key_path = "k.pem"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let connector = crate::tls::insecure_connector().unwrap();
        let hosts = VirtualHosts::from_config(&config, &connector).unwrap();

        assert_eq!(hosts.len(), 4);
        let kinds: Vec<_> = hosts
            .sites()
            .iter()
            .map(|site| site.handler().map(Handler::kind))
            .collect();
        assert_eq!(
            kinds,
            vec![Some("files"), Some("reverse_proxy"), Some("routes"), None]
        );

        match hosts.find("proxy.example").and_then(Site::handler) {
            Some(Handler::Proxy(proxy)) => {
                assert_eq!(proxy.domain(), "capsule.example");
                assert_eq!(proxy.upstreams(), &[Upstream::Tcp("127.0.0.1:2000".to_string())]);
            }
            other => panic!("expected proxy, got {:?}", other),
        }
        match hosts.find("routes.example").and_then(Site::handler) {
            Some(Handler::Router(router)) => assert_eq!(router.patterns(), vec!["/", "/app/"]),
            other => panic!("expected router, got {:?}", other),
        }
    }

    #[test]
    fn test_from_config_rejects_bad_upstream() {
        let toml = r#"
[[sites]]
domain = "proxy.example"
cert_path = "c.pem"
key_path = "k.pem"
[sites.reverse_proxy]
to = ["gopher://old.example:70"]
domain = "proxy.example"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let connector = crate::tls::insecure_connector().unwrap();
        let err = VirtualHosts::from_config(&config, &connector).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUpstream { .. }));
    }
}
