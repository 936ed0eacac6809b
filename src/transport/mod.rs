mod socks5;

use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::time::Duration;

use log::info;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::{ProxyScheme, ProxySpec};
use crate::error::ConfigError;

pub use socks5::Socks5Dialer;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("seedkeeper/", env!("CARGO_PKG_VERSION"));

/// Where outbound connections are routed.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Direct,
    /// Tracker (HTTP) traffic only, peers stay direct
    HttpProxy(Url),
    /// Tracker (HTTP) traffic and TCP peer connections. UDP trackers are not
    /// covered.
    Socks5(Socks5Dialer),
}

/// The dialing strategy handed to the engine: an HTTP client for tracker
/// traffic plus a dialer for peer connections, both honouring the proxy.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    route: Route,
    http_client: reqwest::Client,
}

impl TransportPolicy {
    /// Resolves the policy for an optional proxy. Every failure is fatal, there
    /// is no fallback to direct connections.
    pub fn build(proxy: Option<&ProxySpec>) -> std::result::Result<Self, ConfigError> {
        let route = match proxy {
            None => Route::Direct,
            Some(spec) => match spec.scheme {
                ProxyScheme::Http | ProxyScheme::Https => {
                    info!("Using HTTP(S) proxy for HTTP trackers: {}", spec.host());
                    Route::HttpProxy(spec.url.clone())
                }
                ProxyScheme::Socks5 => {
                    let dialer = Socks5Dialer::from_url(&spec.url)?;
                    info!(
                        "Using SOCKS5 proxy for HTTP trackers and peer connections: {}. \
                         UDP trackers will not use this proxy.",
                        dialer.proxy_address()
                    );
                    Route::Socks5(dialer)
                }
            },
        };
        let http_client = build_http_client(proxy)?;
        Ok(Self { route, http_client })
    }

    /// Parses and resolves a raw `--proxy` value in one step.
    #[cfg(test)]
    pub fn from_uri(uri: &str) -> std::result::Result<Self, ConfigError> {
        let spec = ProxySpec::parse(uri)?;
        Self::build(spec.as_ref())
    }

    #[cfg(test)]
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Client for tracker announces and `.torrent` downloads
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn peer_dialer(&self) -> PeerDialer {
        match &self.route {
            Route::Socks5(dialer) => PeerDialer::Socks5(dialer.clone()),
            Route::Direct | Route::HttpProxy(_) => PeerDialer::Direct,
        }
    }
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            route: Route::Direct,
            http_client: reqwest::Client::new(),
        }
    }
}

fn build_http_client(proxy: Option<&ProxySpec>) -> std::result::Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT);
    if let Some(spec) = proxy {
        let dialer_error = |err: reqwest::Error| ConfigError::ProxyDialer {
            uri: spec.url.to_string(),
            reason: err.to_string(),
        };
        let proxy = reqwest::Proxy::all(spec.url.as_str()).map_err(dialer_error)?;
        builder = builder.proxy(proxy);
        let client = builder.build().map_err(dialer_error)?;
        return Ok(client);
    }
    builder.build().map_err(|err| ConfigError::ProxyDialer {
        uri: String::new(),
        reason: err.to_string(),
    })
}

/// Opens outbound peer connections.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerDialer {
    Direct,
    Socks5(Socks5Dialer),
}

impl PeerDialer {
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let connect = async {
            match self {
                Self::Direct => TcpStream::connect(addr).await,
                Self::Socks5(dialer) => dialer.connect(addr).await,
            }
        };
        timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, format!("connect to {addr} timed out")))?
    }
}
