use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::time::sleep;

use crate::config::SeedPolicy;
use crate::engine::{Transfer, TransferStats};
use crate::format::format_bytes;
use crate::shutdown::{Shutdown, ShutdownReason};

pub const METADATA_POLL: Duration = Duration::from_secs(1);
pub const DOWNLOAD_POLL: Duration = Duration::from_secs(2);
pub const SEEDING_POLL: Duration = Duration::from_secs(5);

/// Owned exclusively by the monitor. The baseline is the ratio denominator and
/// is captured once, when seeding begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedingState {
    pub started: bool,
    pub baseline: u64,
}

/// Result of observing one statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Observe again after the given delay
    Wait(Duration),
    Done(MonitorExit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Download finished and seeding is disabled
    DownloadComplete,
    SeedRatioReached,
}

/// Polls transfer statistics, reports progress and decides when seeding is
/// over.
#[derive(Debug)]
pub struct Monitor {
    policy: SeedPolicy,
    seeding: SeedingState,
}

impl Monitor {
    pub fn new(policy: SeedPolicy) -> Self {
        Self {
            policy,
            seeding: SeedingState::default(),
        }
    }

    #[cfg(test)]
    pub fn seeding(&self) -> SeedingState {
        self.seeding
    }

    pub fn observe(&mut self, name: &str, stats: &TransferStats) -> Tick {
        if !stats.has_info {
            info!("Waiting for torrent info...");
            return Tick::Wait(METADATA_POLL);
        }

        if !stats.is_complete() {
            log_progress(stats);
            return Tick::Wait(DOWNLOAD_POLL);
        }

        let target = match self.policy {
            SeedPolicy::Disabled => {
                log_progress(stats);
                return Tick::Done(MonitorExit::DownloadComplete);
            }
            SeedPolicy::Unbounded => None,
            SeedPolicy::UntilRatio(ratio) => Some(ratio),
        };

        if !self.seeding.started {
            self.seeding = SeedingState {
                started: true,
                baseline: stats.bytes_completed,
            };
            info!("Download complete. Starting to seed: {}", name);
        }

        let uploaded = format_bytes(stats.bytes_uploaded);
        match target {
            Some(target) => {
                let ratio = stats.bytes_uploaded as f64 / self.seeding.baseline as f64;
                info!(
                    "Seeding: {}, Ratio: {:.2}/{:.2}, Uploaded: {}",
                    name, ratio, target, uploaded
                );
                if ratio >= target {
                    info!(
                        "Reached target seed ratio of {:.2}. Stopping seeding.",
                        target
                    );
                    return Tick::Done(MonitorExit::SeedRatioReached);
                }
            }
            None => info!("Seeding: {}, Uploaded: {}", name, uploaded),
        }
        Tick::Wait(SEEDING_POLL)
    }

    /// Observes `transfer` until the download is complete (seeding disabled),
    /// the seed ratio is reached, or shutdown is requested elsewhere. Reaching
    /// the ratio requests shutdown.
    pub async fn run<T: Transfer>(
        mut self,
        transfer: Arc<T>,
        shutdown: Arc<Shutdown>,
    ) -> Option<MonitorExit> {
        while !shutdown.is_requested() {
            let stats = transfer.stats();
            match self.observe(&transfer.name(), &stats) {
                Tick::Wait(delay) => tokio::select! {
                    _ = sleep(delay) => (),
                    _ = shutdown.closed() => return None,
                },
                Tick::Done(MonitorExit::SeedRatioReached) => {
                    shutdown.request(ShutdownReason::SeedRatioReached).await;
                    return Some(MonitorExit::SeedRatioReached);
                }
                Tick::Done(exit) => return Some(exit),
            }
        }
        None
    }
}

fn log_progress(stats: &TransferStats) {
    if stats.total_length == 0 {
        info!(
            "Downloaded {} bytes (metadata not fully resolved yet)",
            stats.bytes_completed
        );
        return;
    }
    let percent = stats.bytes_completed as f64 / stats.total_length as f64 * 100.0;
    info!(
        "{:.2}% complete. Downloaded: {} / {}. Peers: {}, Uploaded: {}",
        percent,
        format_bytes(stats.bytes_completed),
        format_bytes(stats.total_length),
        stats.active_peers,
        format_bytes(stats.bytes_uploaded)
    );
}
