use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{info, warn};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long the engine gets to close and persist its state.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

type CloseFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Why the session is being shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// OS signal, carrying its name
    Interrupted(&'static str),
    SeedRatioReached,
    Completed,
    /// A fatal error after the engine was constructed
    Failed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted(signal) => write!(f, "received signal {}", signal),
            Self::SeedRatioReached => write!(f, "seed ratio reached"),
            Self::Completed => write!(f, "download completed"),
            Self::Failed => write!(f, "session failed"),
        }
    }
}

/// Single-fire shutdown trigger shared by the signal listener, the monitor and
/// the main flow.
///
/// The first [`Shutdown::request`] records its reason and runs the close
/// action; every later request is a no-op. [`Shutdown::closed`] resolves once
/// the close action has finished (or timed out).
pub struct Shutdown {
    reason: OnceLock<ShutdownReason>,
    closed: CancellationToken,
    close: CloseFn,
    close_timeout: Duration,
}

impl Shutdown {
    pub fn new<F, Fut>(close: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_timeout(close, CLOSE_TIMEOUT)
    }

    pub fn with_timeout<F, Fut>(close: F, close_timeout: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            reason: OnceLock::new(),
            closed: CancellationToken::new(),
            close: Box::new(move || Box::pin(close())),
            close_timeout,
        }
    }

    /// Requests shutdown. Returns `true` for the caller that actually closed
    /// the engine.
    pub async fn request(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            return false;
        }
        match &reason {
            ShutdownReason::Interrupted(signal) => {
                info!("Received signal {}, shutting down...", signal)
            }
            reason => info!("Shutting down: {}", reason),
        }
        if timeout(self.close_timeout, (self.close)()).await.is_err() {
            warn!(
                "engine did not close within {:?}, exiting anyway",
                self.close_timeout
            );
        }
        self.closed.cancel();
        true
    }

    /// The reason of the first request, if any was made.
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    pub fn is_requested(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Resolves once the close action of the first request has finished.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Waits for `interrupt` to yield a signal name and requests shutdown with
/// it. Gives up once the session closes for another reason.
pub async fn listen_for_signals<I>(shutdown: Arc<Shutdown>, interrupt: I)
where
    I: Future<Output = std::io::Result<&'static str>>,
{
    tokio::select! {
        signal = interrupt => match signal {
            Ok(name) => {
                shutdown.request(ShutdownReason::Interrupted(name)).await;
            }
            Err(err) => warn!("unable to listen for signals: {}", err),
        },
        _ = shutdown.closed() => (),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "interrupt")
}
