use std::path::PathBuf;

use thiserror::Error;

/// Errors detected while turning operator input into a session configuration.
///
/// All of them are fatal: the session does not start and the operator has to
/// fix the input and run again.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid proxy URI {uri:?}: {source}")]
    InvalidProxyUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported proxy scheme {0:?}, only http, https and socks5 are supported")]
    UnsupportedProxyScheme(String),

    #[error("unable to create proxy dialer for {uri}: {reason}")]
    ProxyDialer { uri: String, reason: String },

    #[error("invalid {direction} rate {value}, expected a non-negative number of Mbps")]
    InvalidRate { direction: &'static str, value: f64 },

    #[error("invalid seed ratio {0}, expected a non-negative number")]
    InvalidSeedRatio(f64),

    #[error("max peers must be at least 1")]
    InvalidMaxPeers,

    #[error("failed to create data directory {}: {source}", path.display())]
    CreateDownloadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
