use crate::proxy::Upstream;
use crate::response::DEFAULT_BODY_LIMIT;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when no config path is given on the command line
pub const CONFIG_ENV: &str = "GEMGATE_CONFIG";

/// Config file used when neither argument nor environment names one
pub const DEFAULT_CONFIG_PATH: &str = "gemgate.toml";

/// Global configuration for the server
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener, limits and timeouts
    #[serde(default)]
    pub server: ServerConfig,

    /// Virtual hosts, in match order
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gemini port (default: 1965)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics HTTP port (default: 23818, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Cap on body bytes per response (default: 4 MiB)
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,

    /// Deadline for the request line (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Deadline for the TLS handshake (default: 10)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Deadline for a whole reverse proxy exchange (default: 30)
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            http_port: default_http_port(),
            max_response_bytes: default_max_response_bytes(),
            request_timeout_secs: default_request_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            proxy_timeout_secs: default_proxy_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.http_port != 0
    }
}

/// One virtual host
#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    /// Host name requests must carry to reach this site
    pub domain: String,

    /// PEM certificate chain presented for `domain`
    pub cert_path: PathBuf,

    /// PEM private key for `cert_path`
    pub key_path: PathBuf,

    pub files: Option<FilesConfig>,

    pub reverse_proxy: Option<ReverseProxyConfig>,

    /// Path patterns, each with its own handler
    pub routes: Option<BTreeMap<String, RouteConfig>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    /// Directory served as the site root
    pub root: PathBuf,

    /// List directories without an index.gmi (default: false)
    #[serde(default)]
    pub auto_index: bool,

    /// Serve `/~user/` from the user's public_gemini (default: false)
    #[serde(default)]
    pub user_paths: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReverseProxyConfig {
    /// Upstream addresses: tcp://, tls:// or unix://
    #[serde(default)]
    pub to: Vec<String>,

    /// Host name written into forwarded requests
    pub domain: String,
}

/// Handler for one route pattern; exactly one table must be set
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub files: Option<FilesConfig>,
    pub reverse_proxy: Option<ReverseProxyConfig>,
}

impl SiteConfig {
    fn validate(&self, errors: &mut Vec<String>) {
        let site = if self.domain.is_empty() {
            errors.push("Site with empty 'domain'".to_string());
            "<empty>"
        } else {
            self.domain.as_str()
        };

        let kinds = [
            self.files.is_some(),
            self.reverse_proxy.is_some(),
            self.routes.is_some(),
        ];
        if kinds.iter().filter(|set| **set).count() > 1 {
            errors.push(format!(
                "Site '{}': only one of 'files', 'reverse_proxy' or 'routes' may be set",
                site
            ));
        }

        if let Some(proxy) = &self.reverse_proxy {
            proxy.validate(site, errors);
        }

        for (pattern, route) in self.routes.iter().flatten() {
            if !pattern.starts_with('/') {
                errors.push(format!(
                    "Site '{}': route pattern '{}' must start with '/'",
                    site, pattern
                ));
            }
            match (&route.files, &route.reverse_proxy) {
                (Some(_), Some(_)) => errors.push(format!(
                    "Site '{}': route '{}' sets both 'files' and 'reverse_proxy'",
                    site, pattern
                )),
                (None, None) => errors.push(format!(
                    "Site '{}': route '{}' needs 'files' or 'reverse_proxy'",
                    site, pattern
                )),
                (None, Some(proxy)) => proxy.validate(site, errors),
                (Some(_), None) => {}
            }
        }
    }
}

impl ReverseProxyConfig {
    fn validate(&self, site: &str, errors: &mut Vec<String>) {
        if self.to.is_empty() {
            errors.push(format!("Site '{}': reverse proxy has no upstreams in 'to'", site));
        }
        for address in &self.to {
            if let Err(e) = Upstream::parse(address) {
                errors.push(format!("Site '{}': {}", site, e));
            }
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1965
}

fn default_http_port() -> u16 {
    23818
}

fn default_max_response_bytes() -> u64 {
    DEFAULT_BODY_LIMIT
}

fn default_request_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_proxy_timeout() -> u64 {
    30
}

/// Config path from the first argument, then `GEMGATE_CONFIG`, then the default
pub fn resolve_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.sites.is_empty() {
            errors.push("No sites configured".to_string());
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            site.validate(&mut errors);
            if !site.domain.is_empty() && !seen.insert(site.domain.as_str()) {
                errors.push(format!("Site '{}' is configured more than once", site.domain));
            }
        }

        if self.server.max_response_bytes == 0 {
            errors.push("'max_response_bytes' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
