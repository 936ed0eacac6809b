use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;
use tokio::time::timeout;

use crate::config::{SeedPolicy, SessionConfig};
use crate::engine::{Engine, EngineConfig, Source, Transfer};
use crate::error::ConfigError;
use crate::monitor::{DOWNLOAD_POLL, Monitor};
use crate::rate_limit::RateLimits;
use crate::shutdown::{self, Shutdown, ShutdownReason};
use crate::transport::TransportPolicy;

/// How long the monitor gets to report final status once the download is done.
const MONITOR_GRACE: Duration = DOWNLOAD_POLL.saturating_add(Duration::from_secs(1));

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Download finished and seeding is disabled
    Completed,
    /// Download finished and the seed ratio was reached
    SeedRatioReached,
    /// Download finished and seeding was interrupted
    SeedingStopped,
    /// Shutdown before the download finished
    Interrupted,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed | Self::SeedRatioReached | Self::SeedingStopped => 0,
            Self::Interrupted => 130,
        }
    }
}

/// Runs one transfer session to a terminal state.
///
/// `build` constructs the engine once the storage root exists and the rate
/// limits and transport policy are resolved. Every error returned is fatal.
pub async fn run<E, F>(config: &SessionConfig, locator: &str, build: F) -> anyhow::Result<Outcome>
where
    E: Engine,
    F: FnOnce(EngineConfig) -> anyhow::Result<E>,
{
    run_until_interrupted(config, locator, build, shutdown::wait_for_signal()).await
}

/// Like [`run`], with `interrupt` standing in for the OS signal listener.
async fn run_until_interrupted<E, F, I>(
    config: &SessionConfig,
    locator: &str,
    build: F,
    interrupt: I,
) -> anyhow::Result<Outcome>
where
    E: Engine,
    F: FnOnce(EngineConfig) -> anyhow::Result<E>,
    I: Future<Output = std::io::Result<&'static str>> + Send + 'static,
{
    create_data_dir(&config.download_dir).await?;
    let limits = RateLimits::new(config.download_rate, config.upload_rate);
    log_seed_policy(config.seed_policy());
    let transport = TransportPolicy::build(config.proxy.as_ref())?;

    let engine = build(EngineConfig {
        data_dir: config.download_dir.clone(),
        max_peers: config.max_peers,
        no_upload: !config.seeding,
        limits,
        transport,
    })
    .context("error creating client")?;
    let engine = Arc::new(engine);
    let shutdown = Arc::new(Shutdown::new({
        let engine = Arc::clone(&engine);
        move || {
            let engine = Arc::clone(&engine);
            async move { engine.close().await }
        }
    }));
    let signals = tokio::spawn(shutdown::listen_for_signals(
        Arc::clone(&shutdown),
        interrupt,
    ));

    let result = drive(config, locator, &*engine, &shutdown).await;
    if result.is_err() {
        shutdown.request(ShutdownReason::Failed).await;
    }
    signals.abort();
    result
}

async fn drive<E: Engine>(
    config: &SessionConfig,
    locator: &str,
    engine: &E,
    shutdown: &Arc<Shutdown>,
) -> anyhow::Result<Outcome> {
    let source = Source::detect(locator);
    let transfer = engine
        .add_source(&source)
        .await
        .with_context(|| format!("error adding torrent {}", locator))?;

    info!("Waiting for torrent info...");
    tokio::select! {
        _ = transfer.info_resolved() => (),
        _ = shutdown.closed() => {
            info!("Shutdown initiated before torrent info was resolved.");
            return Ok(Outcome::Interrupted);
        }
    }
    let name = transfer.name();
    let data_dir = config.download_dir.display();
    info!("Downloading {} to {}/{}...", name, data_dir, name);
    transfer.download_all();

    let policy = config.seed_policy();
    let mut monitor = tokio::spawn(
        Monitor::new(policy).run(Arc::clone(&transfer), Arc::clone(shutdown)),
    );

    if !engine.wait_all().await {
        info!("Shutdown initiated or not all torrents downloaded successfully.");
        // No-op unless the engine closed on its own
        shutdown.request(ShutdownReason::Failed).await;
        shutdown.closed().await;
        monitor.abort();
        info!("Download process finished.");
        let outcome = match shutdown.reason() {
            Some(ShutdownReason::SeedRatioReached) => Outcome::SeedRatioReached,
            _ => Outcome::Interrupted,
        };
        return Ok(outcome);
    }
    info!(
        "Torrent {} downloaded successfully to {}/{}",
        name, data_dir, name
    );

    let outcome = match policy {
        SeedPolicy::Disabled => {
            let _ = timeout(MONITOR_GRACE, &mut monitor).await;
            shutdown.request(ShutdownReason::Completed).await;
            Outcome::Completed
        }
        SeedPolicy::Unbounded | SeedPolicy::UntilRatio(_) => {
            shutdown.closed().await;
            match shutdown.reason() {
                Some(ShutdownReason::SeedRatioReached) => Outcome::SeedRatioReached,
                _ => Outcome::SeedingStopped,
            }
        }
    };
    monitor.abort();
    info!("Download process finished.");
    Ok(outcome)
}

async fn create_data_dir(path: &Path) -> Result<(), ConfigError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| ConfigError::CreateDownloadDir {
            path: path.to_path_buf(),
            source,
        })
}

fn log_seed_policy(policy: SeedPolicy) {
    match policy {
        SeedPolicy::Disabled => info!("Seeding disabled"),
        SeedPolicy::Unbounded => info!("Seeding enabled with unlimited ratio"),
        SeedPolicy::UntilRatio(ratio) => info!("Seeding enabled with ratio {:.2}", ratio),
    }
}
