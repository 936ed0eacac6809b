use std::path::PathBuf;
use std::time::Duration;

use crate::core::PeerId;
use crate::engine::EngineConfig;
use crate::rate_limit::RateLimits;
use crate::transport::TransportPolicy;

/// Settings shared by every download of a client
#[derive(Clone, Debug)]
pub struct Config {
    // Identity and network
    /// Unique identifier for this client in the swarm
    pub client_id: PeerId,
    /// Port announced to trackers
    pub port: u16,
    /// Directory downloads are stored under
    pub data_dir: PathBuf,
    pub transport: TransportPolicy,
    pub limits: RateLimits,
    /// Never unchoke peers or serve blocks
    pub no_upload: bool,

    // Peers
    /// Connections per download, dialed and accepted
    pub max_peers: usize,
    /// Maximum number of outstanding block requests per peer
    pub max_requests_per_peer: usize,
    pub block_size: usize,
    /// Time after which a block request is considered abandoned
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Interval between keep-alive messages on an idle connection
    pub keep_alive_interval: Duration,

    // Choker
    /// Interval between choking algorithm runs
    pub choking_interval: Duration,
    /// Number of choking rounds between optimistic unchokes
    pub optimistic_choking_cycle: usize,

    // Trackers
    /// Lower bound for tracker-provided announce intervals
    pub min_announce_interval: Duration,
    /// First retry delay after a failed announce, doubled on each failure
    pub announce_retry: Duration,
    pub announce_timeout: Duration,
}

impl Config {
    pub fn new(engine: EngineConfig, port: u16) -> Self {
        Self {
            client_id: PeerId::random(),
            port,
            data_dir: engine.data_dir,
            transport: engine.transport,
            limits: engine.limits,
            no_upload: engine.no_upload,
            max_peers: engine.max_peers,
            max_requests_per_peer: 16,
            block_size: 16 * 1024,
            request_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(90),
            choking_interval: Duration::from_secs(10),
            optimistic_choking_cycle: 3,
            min_announce_interval: Duration::from_secs(60),
            announce_retry: Duration::from_secs(15),
            announce_timeout: Duration::from_secs(30),
        }
    }
}
