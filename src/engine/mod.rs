//! The seam between the session controller and the transfer engine.
//!
//! The controller only needs to add one content source, wait for its
//! metadata, start the download, read point-in-time statistics, wait for
//! completion and close the engine. Anything implementing [`Engine`] can be
//! driven by [`crate::session`].

#[cfg(test)]
pub mod fake;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::rate_limit::RateLimits;
use crate::transport::TransportPolicy;

/// Everything the engine is constructed with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Storage root, already created
    pub data_dir: PathBuf,
    /// Maximum established peer connections per transfer
    pub max_peers: usize,
    /// Refuse to upload anything (seeding disabled)
    pub no_upload: bool,
    pub limits: RateLimits,
    pub transport: TransportPolicy,
}

/// A content locator given by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A metainfo (`.torrent`) file on disk
    File(PathBuf),
    /// A magnet link or a URL pointing at a metainfo file
    Uri(String),
}

impl Source {
    /// Treats the locator as a file when one exists at that path and as a URI
    /// otherwise.
    pub fn detect(locator: &str) -> Self {
        let path = Path::new(locator);
        if path.exists() {
            Self::File(path.to_path_buf())
        } else {
            Self::Uri(locator.to_string())
        }
    }
}

/// Point-in-time statistics of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    /// Verified payload bytes stored locally
    pub bytes_completed: u64,
    /// Payload bytes sent to peers
    pub bytes_uploaded: u64,
    pub active_peers: usize,
    /// Total content length, 0 while unknown
    pub total_length: u64,
    /// Whether the metainfo has been resolved
    pub has_info: bool,
}

impl TransferStats {
    pub fn is_complete(&self) -> bool {
        self.total_length > 0 && self.bytes_completed == self.total_length
    }
}

pub trait Engine: Send + Sync + 'static {
    type Transfer: Transfer;

    /// Adds a content source and returns a handle to its transfer.
    fn add_source(
        &self,
        source: &Source,
    ) -> impl Future<Output = anyhow::Result<Arc<Self::Transfer>>> + Send;

    /// Resolves to `true` once every transfer has all of its data, or to
    /// `false` if the engine was closed before that happened.
    fn wait_all(&self) -> impl Future<Output = bool> + Send;

    /// Stops all transfers and persists resume data. Safe to call more than
    /// once.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait Transfer: Send + Sync + 'static {
    /// Display name: the content name once known, something identifying before
    fn name(&self) -> String;

    /// Resolves once the metainfo is known.
    fn info_resolved(&self) -> impl Future<Output = ()> + Send;

    /// Non-blocking statistics snapshot
    fn stats(&self) -> TransferStats;

    /// Starts requesting every piece of the content.
    fn download_all(&self);
}
