use std::fmt;
use std::path::PathBuf;

use derive_builder::Builder;
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_MAX_PEERS: usize = 50;
pub const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";

/// Settings for a single transfer session, resolved once from operator input.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct SessionConfig {
    /// Maximum number of established peer connections per transfer
    #[builder(default = "DEFAULT_MAX_PEERS")]
    pub max_peers: usize,
    /// Storage root for downloaded content and resume data
    #[builder(setter(into), default = "PathBuf::from(DEFAULT_DOWNLOAD_DIR)")]
    pub download_dir: PathBuf,
    /// Download cap, `None` means unlimited
    #[builder(setter(strip_option), default)]
    pub download_rate: Option<Rate>,
    /// Upload cap, `None` means unlimited
    #[builder(setter(strip_option), default)]
    pub upload_rate: Option<Rate>,
    /// Keep uploading once the download completes
    #[builder(default)]
    pub seeding: bool,
    /// Stop seeding once uploaded / downloaded reaches this ratio, `None` means never
    #[builder(setter(strip_option), default)]
    pub seed_ratio: Option<f64>,
    #[builder(setter(strip_option), default)]
    pub proxy: Option<ProxySpec>,
}

impl SessionConfig {
    pub fn seed_policy(&self) -> SeedPolicy {
        match (self.seeding, self.seed_ratio) {
            (false, _) => SeedPolicy::Disabled,
            (true, Some(ratio)) if ratio > 0.0 => SeedPolicy::UntilRatio(ratio),
            (true, _) => SeedPolicy::Unbounded,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            download_rate: None,
            upload_rate: None,
            seeding: false,
            seed_ratio: None,
            proxy: None,
        }
    }
}

/// What happens once the download has completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeedPolicy {
    Disabled,
    Unbounded,
    UntilRatio(f64),
}

/// A throughput cap, specified by the operator in megabits per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    mbps: f64,
}

impl Rate {
    /// Returns `None` for zero (and anything not strictly positive), which
    /// stands for "no cap".
    pub fn from_mbps(mbps: f64) -> Option<Self> {
        if mbps.is_finite() && mbps > 0.0 {
            Some(Self { mbps })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn mbps(&self) -> f64 {
        self.mbps
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.mbps * 1024.0 * 1024.0 / 8.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} Mbps", self.mbps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

/// A parsed proxy URI whose scheme is known to be supported.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySpec {
    pub scheme: ProxyScheme,
    pub url: Url,
}

impl ProxySpec {
    /// Parses the `--proxy` argument. An empty string means no proxy.
    pub fn parse(uri: &str) -> Result<Option<Self>, ConfigError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Ok(None);
        }
        let url = Url::parse(uri).map_err(|source| ConfigError::InvalidProxyUri {
            uri: uri.to_string(),
            source,
        })?;
        let scheme = match url.scheme() {
            "http" => ProxyScheme::Http,
            "https" => ProxyScheme::Https,
            "socks5" => ProxyScheme::Socks5,
            other => return Err(ConfigError::UnsupportedProxyScheme(other.to_string())),
        };
        Ok(Some(Self { scheme, url }))
    }

    /// `host:port` of the proxy, without credentials, for log lines.
    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}
