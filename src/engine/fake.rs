//! In-memory engine driven by a fixed script, used to exercise the session
//! controller without any network.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineConfig, Source, Transfer, TransferStats};

/// How often the scripted transfer advances.
pub const STEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub total_length: u64,
    /// Bytes completed per step while downloading
    pub download_step: u64,
    /// Bytes uploaded per step once the download is complete
    pub upload_step: u64,
    pub info_delay: Duration,
    pub fail_add: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            name: "ubuntu.iso".to_string(),
            total_length: 4000,
            download_step: 1000,
            upload_step: 0,
            info_delay: Duration::from_millis(1500),
            fail_add: false,
        }
    }
}

/// What the engine saw, shared with the test.
#[derive(Debug, Default)]
pub struct Probe {
    pub close_calls: AtomicUsize,
    pub added: Mutex<Vec<Source>>,
    pub data_dir_existed_on_add: Mutex<Option<bool>>,
    /// `bytes_completed` of every statistics snapshot handed out
    pub observed: Mutex<Vec<u64>>,
    pub config: Mutex<Option<EngineConfig>>,
}

impl Probe {
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

pub struct FakeEngine {
    data_dir: PathBuf,
    script: Script,
    probe: Arc<Probe>,
    closed: CancellationToken,
    transfer: Mutex<Option<Arc<FakeTransfer>>>,
}

impl FakeEngine {
    pub fn new(config: EngineConfig, script: Script, probe: Arc<Probe>) -> Self {
        let data_dir = config.data_dir.clone();
        *probe.config.lock().unwrap() = Some(config);
        Self {
            data_dir,
            script,
            probe,
            closed: CancellationToken::new(),
            transfer: Mutex::new(None),
        }
    }

    /// Closes the engine from outside the session, as a crashing engine would.
    pub fn closer(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Engine for FakeEngine {
    type Transfer = FakeTransfer;

    async fn add_source(&self, source: &Source) -> anyhow::Result<Arc<FakeTransfer>> {
        *self.probe.data_dir_existed_on_add.lock().unwrap() =
            Some(self.data_dir.is_dir());
        self.probe.added.lock().unwrap().push(source.clone());
        if self.script.fail_add {
            return Err(anyhow!("unsupported source {:?}", source));
        }
        let transfer = Arc::new(FakeTransfer::new(
            self.script.clone(),
            Arc::clone(&self.probe),
            self.closed.clone(),
        ));
        transfer.resolve_info_later();
        *self.transfer.lock().unwrap() = Some(Arc::clone(&transfer));
        Ok(transfer)
    }

    async fn wait_all(&self) -> bool {
        let transfer = self.transfer.lock().unwrap().clone();
        let Some(transfer) = transfer else {
            return true;
        };
        let mut complete = transfer.inner.complete.subscribe();
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            _ = complete.wait_for(|done| *done) => true,
        }
    }

    async fn close(&self) {
        self.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

pub struct FakeTransfer {
    inner: Arc<Inner>,
}

struct Inner {
    script: Script,
    probe: Arc<Probe>,
    closed: CancellationToken,
    stats: Mutex<TransferStats>,
    info: watch::Sender<bool>,
    complete: watch::Sender<bool>,
}

impl Inner {
    /// Moves the script one step forward, returns whether the download is complete.
    fn advance(&self) -> bool {
        let mut stats = self.stats.lock().unwrap();
        if stats.bytes_completed < stats.total_length {
            stats.bytes_completed =
                (stats.bytes_completed + self.script.download_step).min(stats.total_length);
            stats.active_peers = 3;
        } else {
            stats.bytes_uploaded += self.script.upload_step;
        }
        stats.is_complete()
    }
}

impl FakeTransfer {
    fn new(script: Script, probe: Arc<Probe>, closed: CancellationToken) -> Self {
        let (info, _) = watch::channel(false);
        let (complete, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                script,
                probe,
                closed,
                stats: Mutex::new(TransferStats::default()),
                info,
                complete,
            }),
        }
    }

    fn resolve_info_later(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            sleep(inner.script.info_delay).await;
            {
                let mut stats = inner.stats.lock().unwrap();
                stats.has_info = true;
                stats.total_length = inner.script.total_length;
            }
            inner.info.send_replace(true);
        });
    }
}

impl Transfer for FakeTransfer {
    fn name(&self) -> String {
        self.inner.script.name.clone()
    }

    async fn info_resolved(&self) {
        let mut info = self.inner.info.subscribe();
        let _ = info.wait_for(|resolved| *resolved).await;
    }

    fn stats(&self) -> TransferStats {
        let stats = *self.inner.stats.lock().unwrap();
        self.inner
            .probe
            .observed
            .lock()
            .unwrap()
            .push(stats.bytes_completed);
        stats
    }

    fn download_all(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut steps = interval(STEP);
            loop {
                tokio::select! {
                    _ = inner.closed.cancelled() => break,
                    _ = steps.tick() => {
                        if inner.advance() {
                            inner.complete.send_replace(true);
                        }
                    }
                }
            }
        });
    }
}
