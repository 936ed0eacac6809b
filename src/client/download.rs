use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{Notify, Semaphore, broadcast, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::choke;
use crate::client::config::Config;
use crate::client::lock;
use crate::client::metadata::MetadataAssembler;
use crate::client::peer;
use crate::client::picker::Picker;
use crate::client::resume;
use crate::core::{Sha1, TransferRate};
use crate::engine::{Transfer, TransferStats};
use crate::message::{Block, BlockData, Handshake, METADATA_PIECE_SIZE};
use crate::storage::{Joiner, Status, Storage};
use crate::torrent::Info;
use crate::tracker::{self, Event, TrackerRequest};

/// `left` reported to trackers before the content size is known. Any
/// non-zero value marks us as a leecher.
const UNKNOWN_LEFT: u64 = 16 * 1024 * 1024;
const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ANNOUNCE_RETRY: Duration = Duration::from_secs(30 * 60);
const HAVES_BUFFER: usize = 64;

/// One transfer: its metadata, piece bookkeeping, trackers and peers.
pub struct Download {
    config: Arc<Config>,
    info_hash: Sha1,
    display_name: Option<String>,
    trackers: Vec<Url>,
    info: OnceLock<Arc<Info>>,
    storage: OnceLock<Storage>,
    pieces: Mutex<Option<Pieces>>,
    metadata: Mutex<MetadataAssembler>,
    resolving: AtomicBool,
    info_ready: watch::Sender<bool>,
    wanted: watch::Sender<bool>,
    complete: watch::Sender<bool>,
    haves: broadcast::Sender<usize>,
    peers: Mutex<HashMap<SocketAddr, Arc<PeerHandle>>>,
    candidates: Mutex<Candidates>,
    new_candidates: Notify,
    slots: Arc<Semaphore>,
    completed: AtomicU64,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    cancel: CancellationToken,
}

pub struct Pieces {
    pub picker: Picker,
    pub joiner: Joiner,
}

/// What the choker knows about a connected peer.
pub struct PeerHandle {
    pub interested: AtomicBool,
    /// Set by the choker, followed by the peer session
    pub unchoke: watch::Sender<bool>,
    /// Payload bytes received since the last choking round
    pub downloaded: AtomicU64,
    /// Payload bytes sent since the last choking round
    pub uploaded: AtomicU64,
}

impl PeerHandle {
    fn new() -> Self {
        let (unchoke, _) = watch::channel(false);
        Self {
            interested: AtomicBool::new(false),
            unchoke,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        }
    }
}

/// Addresses waiting to be dialed, plus every address queued or connected
#[derive(Default)]
struct Candidates {
    queue: VecDeque<SocketAddr>,
    known: HashSet<SocketAddr>,
}

impl Download {
    pub fn new(
        config: Arc<Config>,
        info_hash: Sha1,
        display_name: Option<String>,
        trackers: Vec<Url>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (info_ready, _) = watch::channel(false);
        let (wanted, _) = watch::channel(false);
        let (complete, _) = watch::channel(false);
        let (haves, _) = broadcast::channel(HAVES_BUFFER);
        let slots = Arc::new(Semaphore::new(config.max_peers));
        Arc::new(Self {
            config,
            info_hash,
            display_name,
            trackers,
            info: OnceLock::new(),
            storage: OnceLock::new(),
            pieces: Mutex::new(None),
            metadata: Mutex::new(MetadataAssembler::default()),
            resolving: AtomicBool::new(false),
            info_ready,
            wanted,
            complete,
            haves,
            peers: Mutex::new(HashMap::new()),
            candidates: Mutex::new(Candidates::default()),
            new_candidates: Notify::new(),
            slots,
            completed: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            cancel,
        })
    }

    /// Starts the tracker, dialing and choking tasks.
    pub fn start(self: &Arc<Self>) {
        if self.trackers.is_empty() {
            warn!("{}: no trackers, waiting for incoming peers", self.name());
        }
        for tracker in &self.trackers {
            tokio::spawn(Arc::clone(self).announce_loop(tracker.clone()));
        }
        tokio::spawn(Arc::clone(self).dial_peers());
        if !self.config.no_upload {
            tokio::spawn(Arc::clone(self).choke_peers());
        }
    }

    pub fn info_hash(&self) -> Sha1 {
        self.info_hash
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn info(&self) -> Option<&Arc<Info>> {
        self.info.get()
    }

    /// Metadata and storage, once both are in place.
    pub fn ready(&self) -> Option<(&Arc<Info>, &Storage)> {
        Some((self.info.get()?, self.storage.get()?))
    }

    pub fn is_wanted(&self) -> bool {
        *self.wanted.borrow()
    }

    pub fn subscribe_info(&self) -> watch::Receiver<bool> {
        self.info_ready.subscribe()
    }

    pub fn subscribe_wanted(&self) -> watch::Receiver<bool> {
        self.wanted.subscribe()
    }

    pub fn subscribe_haves(&self) -> broadcast::Receiver<usize> {
        self.haves.subscribe()
    }

    /// Runs `f` on the piece bookkeeping, `None` while metadata is unknown.
    pub fn with_pieces<R>(&self, f: impl FnOnce(&mut Pieces) -> R) -> Option<R> {
        lock(&self.pieces).as_mut().map(f)
    }

    /// Resolves once every piece is verified.
    pub async fn completed(&self) {
        let mut complete = self.complete.subscribe();
        let _ = complete.wait_for(|done| *done).await;
    }

    /// Installs the metadata: allocates storage, loads resume data and lets
    /// peer sessions start exchanging pieces. Later calls are no-ops.
    pub async fn resolve(&self, info: Info) -> Result<()> {
        if self.resolving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.install(info).await;
        if result.is_err() {
            self.resolving.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn install(&self, info: Info) -> Result<()> {
        let storage = Storage::new(&self.config.data_dir, &info);
        storage
            .allocate()
            .await
            .with_context(|| format!("unable to allocate storage for {}", info.name()))?;

        let mut picker = Picker::new(&info, self.config.block_size);
        let resumed = resume::load(&self.resume_path(), &self.info_hash, info.total_pieces()).await;
        let mut completed = 0;
        for piece in resumed.iter() {
            if storage.verify_piece(&info, piece).await {
                picker.piece_verified(piece);
                completed += info.piece_size(piece) as u64;
            }
        }
        if !resumed.is_empty() {
            info!(
                "{}: resumed {} of {} pieces",
                info.name(),
                picker.bitfield().len(),
                info.total_pieces()
            );
        }
        let complete = picker.is_complete();
        let joiner = Joiner::new(&info, self.config.block_size);

        let _ = self.storage.set(storage);
        *lock(&self.pieces) = Some(Pieces { picker, joiner });
        self.completed.store(completed, Ordering::SeqCst);
        let _ = self.info.set(Arc::new(info));
        self.info_ready.send_replace(true);
        if complete {
            self.complete.send_replace(true);
        }
        Ok(())
    }

    /// Handles a block a peer sent in answer to one of our requests.
    pub async fn receive_block(&self, block_data: BlockData) -> Result<()> {
        let block = Block::from(&block_data);
        let status = {
            let mut pieces = lock(&self.pieces);
            let Some(pieces) = pieces.as_mut() else {
                return Ok(());
            };
            if !pieces.picker.is_requested(&block) {
                debug!("dropping block no longer requested: {:?}", block);
                return Ok(());
            }
            match pieces.joiner.add(block_data) {
                Ok(status) => {
                    pieces.picker.block_received(&block);
                    status
                }
                Err(err) => {
                    pieces.picker.release(&block);
                    return Err(err);
                }
            }
        };
        self.downloaded
            .fetch_add(block.length as u64, Ordering::Relaxed);

        match status {
            Status::Incomplete => Ok(()),
            Status::Invalid => {
                warn!("piece {} failed verification, downloading it again", block.piece);
                self.with_pieces(|pieces| pieces.picker.piece_failed(block.piece));
                Ok(())
            }
            Status::Complete { offset, data } => {
                let storage = self
                    .storage
                    .get()
                    .ok_or_else(|| anyhow!("storage not ready"))?;
                if let Err(err) = storage.write(offset, &data).await {
                    self.with_pieces(|pieces| pieces.picker.piece_failed(block.piece));
                    return Err(err);
                }
                let complete = self
                    .with_pieces(|pieces| {
                        pieces.picker.piece_verified(block.piece);
                        pieces.picker.is_complete()
                    })
                    .unwrap_or(false);
                self.completed
                    .fetch_add(data.len() as u64, Ordering::SeqCst);
                let _ = self.haves.send(block.piece);
                if complete {
                    info!("{}: all pieces verified", self.name());
                    self.complete.send_replace(true);
                    self.save_resume().await;
                }
                Ok(())
            }
        }
    }

    /// Next metadata piece to request from a peer announcing `size` bytes of
    /// metadata.
    pub fn next_metadata_request(&self, size: usize) -> Option<usize> {
        if self.info.get().is_some() {
            return None;
        }
        let mut metadata = lock(&self.metadata);
        if let Err(err) = metadata.set_size(size) {
            debug!("ignoring metadata size: {:#}", err);
            return None;
        }
        metadata.next_request(Instant::now())
    }

    pub fn metadata_rejected(&self, piece: usize) {
        lock(&self.metadata).release(piece);
    }

    pub async fn metadata_received(&self, piece: usize, data: Vec<u8>) -> Result<()> {
        if self.info.get().is_some() {
            return Ok(());
        }
        let assembled = lock(&self.metadata).add(piece, data)?;
        let Some(metadata) = assembled else {
            return Ok(());
        };
        match Info::from_metadata(&metadata, self.info_hash) {
            Ok(info) => {
                info!("Received metadata for {}", info.name());
                self.resolve(info).await
            }
            Err(err) => {
                warn!("discarding metadata: {:#}", err);
                lock(&self.metadata).reset();
                Ok(())
            }
        }
    }

    /// A piece of our metadata for a peer: (total size, piece data).
    pub fn metadata_piece(&self, piece: usize) -> Option<(usize, Vec<u8>)> {
        let metadata = &self.info.get()?.metadata;
        let start = piece.checked_mul(METADATA_PIECE_SIZE)?;
        if start >= metadata.len() {
            return None;
        }
        let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
        Some((metadata.len(), metadata[start..end].to_vec()))
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Registers a connected peer, `None` if it is already connected.
    pub fn register_peer(&self, addr: SocketAddr) -> Option<Arc<PeerHandle>> {
        let mut peers = lock(&self.peers);
        if peers.contains_key(&addr) {
            return None;
        }
        let handle = Arc::new(PeerHandle::new());
        peers.insert(addr, Arc::clone(&handle));
        Some(handle)
    }

    pub fn unregister_peer(&self, addr: &SocketAddr) {
        lock(&self.peers).remove(addr);
    }

    #[cfg(test)]
    pub fn peer_handle(&self, addr: &SocketAddr) -> Option<Arc<PeerHandle>> {
        lock(&self.peers).get(addr).cloned()
    }

    /// Queues tracker-provided addresses for dialing.
    pub fn add_peers(&self, addrs: &[SocketAddr]) {
        let mut added = 0;
        {
            let mut candidates = lock(&self.candidates);
            for addr in addrs {
                if candidates.known.insert(*addr) {
                    candidates.queue.push_back(*addr);
                    added += 1;
                }
            }
        }
        for _ in 0..added {
            self.new_candidates.notify_one();
        }
    }

    /// Makes an address dialable again once its connection is gone.
    fn forget(&self, addr: &SocketAddr) {
        lock(&self.candidates).known.remove(addr);
    }

    /// Serves a connection accepted by the listener.
    pub async fn accept(
        self: Arc<Self>,
        socket: TcpStream,
        addr: SocketAddr,
        handshake: Handshake,
    ) -> Result<()> {
        let Ok(_permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            return Err(anyhow!("peer limit reached"));
        };
        if !lock(&self.candidates).known.insert(addr) {
            return Err(anyhow!("already connected"));
        }
        let result = peer::run(Arc::clone(&self), socket, addr, Some(handshake)).await;
        self.forget(&addr);
        result
    }

    /// Persists verified pieces so a restart does not download them again.
    pub async fn save_resume(&self) {
        let Some(info) = self.info.get() else {
            return;
        };
        let Some(bitfield) = self.with_pieces(|pieces| pieces.picker.bitfield()) else {
            return;
        };
        let path = self.resume_path();
        if let Err(err) = resume::save(&path, &self.info_hash, &bitfield, info.total_pieces()).await {
            warn!("unable to save resume data: {:#}", err);
        }
    }

    /// Stops every task of this download, saves resume data and tells the
    /// trackers we are leaving.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.save_resume().await;
        let announces = self.trackers.iter().map(|tracker| {
            let request = self.tracker_request(tracker.clone(), Some(Event::Stopped), None);
            async move {
                let client = self.config.transport.http_client();
                match timeout(STOPPED_ANNOUNCE_TIMEOUT, tracker::announce(client, &request)).await {
                    Ok(Ok(_)) => debug!("announced stop to {}", request.announce),
                    Ok(Err(err)) => debug!("stop announce to {} failed: {:#}", request.announce, err),
                    Err(_) => debug!("stop announce to {} timed out", request.announce),
                }
            }
        });
        join_all(announces).await;
    }

    fn resume_path(&self) -> PathBuf {
        resume::path(&self.config.data_dir, &self.info_hash)
    }

    fn tracker_request(
        &self,
        announce: Url,
        event: Option<Event>,
        tracker_id: Option<String>,
    ) -> TrackerRequest {
        let completed = self.completed.load(Ordering::SeqCst);
        let left = match self.info.get() {
            Some(info) => (info.total_size() as u64).saturating_sub(completed),
            None => UNKNOWN_LEFT,
        };
        TrackerRequest {
            announce,
            info_hash: self.info_hash,
            peer_id: self.config.client_id,
            port: self.config.port,
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left,
            event,
            tracker_id,
        }
    }

    async fn announce_loop(self: Arc<Self>, tracker: Url) {
        let client = self.config.transport.http_client();
        let mut complete = self.complete.subscribe();
        let mut completed_sent = *complete.borrow_and_update();
        let mut event = Some(Event::Started);
        let mut tracker_id = None;
        let mut failures = 0;
        loop {
            let request = self.tracker_request(tracker.clone(), event, tracker_id.clone());
            let announce = timeout(
                self.config.announce_timeout,
                tracker::announce(client, &request),
            );
            let wait = match announce.await {
                Ok(Ok(response)) => {
                    debug!(
                        "{} returned {} peers, next announce in {:?}",
                        tracker,
                        response.peers.len(),
                        response.interval
                    );
                    if let Some(warning) = &response.warning {
                        warn!("{}: {}", tracker, warning);
                    }
                    if response.tracker_id.is_some() {
                        tracker_id = response.tracker_id.clone();
                    }
                    self.add_peers(&response.peers);
                    failures = 0;
                    event = None;
                    response.interval.max(self.config.min_announce_interval)
                }
                Ok(Err(err)) => {
                    warn!("announce to {} failed: {:#}", tracker, err);
                    failures += 1;
                    self.retry_delay(failures)
                }
                Err(_) => {
                    warn!("announce to {} timed out", tracker);
                    failures += 1;
                    self.retry_delay(failures)
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(wait) => (),
                Ok(()) = complete.changed(), if !completed_sent => {
                    if *complete.borrow_and_update() {
                        completed_sent = true;
                        event = Some(Event::Completed);
                    }
                }
            }
        }
    }

    fn retry_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.config
            .announce_retry
            .saturating_mul(factor)
            .min(MAX_ANNOUNCE_RETRY)
    }

    async fn next_candidate(&self) -> SocketAddr {
        loop {
            let next = lock(&self.candidates).queue.pop_front();
            if let Some(addr) = next {
                return addr;
            }
            self.new_candidates.notified().await;
        }
    }

    async fn dial_peers(self: Arc<Self>) {
        let dialer = self.config.transport.peer_dialer();
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => return,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let addr = tokio::select! {
                _ = self.cancel.cancelled() => return,
                addr = self.next_candidate() => addr,
            };
            let download = Arc::clone(&self);
            let dialer = dialer.clone();
            tokio::spawn(async move {
                let _permit = permit;
                debug!("[{}] connecting...", addr);
                let result = match dialer.connect(addr).await {
                    Ok(socket) => peer::run(Arc::clone(&download), socket, addr, None).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = result {
                    debug!("[{}] disconnected: {:#}", addr, err);
                }
                download.forget(&addr);
            });
        }
    }

    async fn choke_peers(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.choking_interval);
        let mut last_round = Instant::now();
        let mut round = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => (),
            }
            let elapsed = last_round.elapsed();
            last_round = Instant::now();
            // Seeders reward the peers they upload to fastest
            let seeding = *self.complete.borrow();

            let mut interested = HashSet::new();
            let mut unchoked = HashSet::new();
            let mut rates = HashMap::new();
            for (addr, handle) in lock(&self.peers).iter() {
                if handle.interested.load(Ordering::Relaxed) {
                    interested.insert(*addr);
                }
                if *handle.unchoke.borrow() {
                    unchoked.insert(*addr);
                }
                let bytes = if seeding {
                    handle.uploaded.swap(0, Ordering::Relaxed)
                } else {
                    handle.downloaded.swap(0, Ordering::Relaxed)
                };
                rates.insert(*addr, TransferRate::new(bytes, elapsed));
            }

            let optimistic = round % self.config.optimistic_choking_cycle == 0;
            let decision = choke::choke(&interested, &unchoked, &rates, optimistic);
            round += 1;
            debug!(
                "choking round: unchoke {:?}, choke {:?}",
                decision.peers_to_unchoke, decision.peers_to_choke
            );

            let peers = lock(&self.peers);
            let updates = decision
                .peers_to_choke
                .iter()
                .map(|addr| (addr, false))
                .chain(decision.peers_to_unchoke.iter().map(|addr| (addr, true)));
            for (addr, unchoke) in updates {
                if let Some(handle) = peers.get(addr) {
                    handle.unchoke.send_replace(unchoke);
                }
            }
            drop(peers);
        }
    }
}

impl Transfer for Download {
    fn name(&self) -> String {
        match (self.info.get(), &self.display_name) {
            (Some(info), _) => info.name().to_string(),
            (None, Some(name)) => name.clone(),
            (None, None) => self.info_hash.to_hex(),
        }
    }

    async fn info_resolved(&self) {
        let mut info_ready = self.info_ready.subscribe();
        let _ = info_ready.wait_for(|ready| *ready).await;
    }

    fn stats(&self) -> TransferStats {
        let info = self.info.get();
        TransferStats {
            bytes_completed: self.completed.load(Ordering::SeqCst),
            bytes_uploaded: self.uploaded.load(Ordering::Relaxed),
            active_peers: lock(&self.peers).len(),
            total_length: info.map_or(0, |info| info.total_size() as u64),
            has_info: info.is_some(),
        }
    }

    fn download_all(&self) {
        self.wanted.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use bit_set::BitSet;

    use super::*;
    use crate::bencoding::Value;
    use crate::engine::EngineConfig;

    const PIECE_SIZE: usize = 32 * 1024;

    fn config(data_dir: &Path) -> Arc<Config> {
        let engine = EngineConfig {
            data_dir: data_dir.to_path_buf(),
            max_peers: 4,
            no_upload: false,
            limits: Default::default(),
            transport: Default::default(),
        };
        Arc::new(Config::new(engine, 6881))
    }

    /// Content of two and a half pieces, plus its info.
    fn content() -> (Vec<u8>, Info) {
        let data: Vec<u8> = (0..PIECE_SIZE * 5 / 2).map(|i| (i % 251) as u8).collect();
        let hashes: Vec<u8> = data
            .chunks(PIECE_SIZE)
            .flat_map(|piece| Sha1::digest(piece).0)
            .collect();
        let value = Value::dictionary()
            .with_entry("name", Value::string("sample.bin"))
            .with_entry("length", Value::Integer(data.len() as i64))
            .with_entry("piece length", Value::Integer(PIECE_SIZE as i64))
            .with_entry("pieces", Value::String(hashes));
        (data, Info::try_from(value).unwrap())
    }

    fn download(data_dir: &Path, info: &Info) -> Arc<Download> {
        Download::new(
            config(data_dir),
            info.info_hash,
            None,
            Vec::new(),
            CancellationToken::new(),
        )
    }

    async fn feed_piece(download: &Download, data: &[u8], piece: usize) {
        let peer: BitSet = [piece].into_iter().collect();
        loop {
            let block = download
                .with_pieces(|pieces| pieces.picker.next_block(&peer))
                .flatten();
            let Some(block) = block else {
                break;
            };
            let start = block.global_offset(PIECE_SIZE);
            let block_data = BlockData {
                piece: block.piece,
                offset: block.offset,
                data: data[start..start + block.length].to_vec(),
            };
            download.receive_block(block_data).await.unwrap();
        }
    }

    #[tokio::test]
    async fn name_before_and_after_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (_, info) = content();
        let unnamed = download(dir.path(), &info);
        let named = Download::new(
            config(dir.path()),
            info.info_hash,
            Some("display".to_string()),
            Vec::new(),
            CancellationToken::new(),
        );

        assert_eq!(unnamed.name(), info.info_hash.to_hex());
        assert_eq!(named.name(), "display");
        named.resolve(info).await.unwrap();
        assert_eq!(named.name(), "sample.bin");
    }

    #[tokio::test]
    async fn stats_follow_verified_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let (data, info) = content();
        let download = download(dir.path(), &info);

        assert_eq!(download.stats(), TransferStats::default());
        download.resolve(info.clone()).await.unwrap();
        download.info_resolved().await;
        feed_piece(&download, &data, 2).await;

        let stats = download.stats();
        assert!(stats.has_info);
        assert_eq!(stats.total_length, data.len() as u64);
        assert_eq!(stats.bytes_completed, (PIECE_SIZE / 2) as u64);
        assert!(!stats.is_complete());
    }

    #[tokio::test]
    async fn complete_download_is_written_and_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let (data, info) = content();
        let download = download(dir.path(), &info);
        download.resolve(info.clone()).await.unwrap();
        let mut haves = download.subscribe_haves();

        for piece in 0..3 {
            feed_piece(&download, &data, piece).await;
        }
        download.completed().await;

        assert!(download.stats().is_complete());
        assert_eq!(haves.recv().await.unwrap(), 0);
        let written = std::fs::read(dir.path().join("sample.bin")).unwrap();
        assert_eq!(written, data);

        // A fresh download of the same content picks up where this one left off
        let resumed = self::download(dir.path(), &info);
        resumed.resolve(info).await.unwrap();
        resumed.completed().await;
        assert_eq!(resumed.stats().bytes_completed, data.len() as u64);
    }

    #[tokio::test]
    async fn corrupt_piece_is_requested_again() {
        let dir = tempfile::tempdir().unwrap();
        let (data, info) = content();
        let download = download(dir.path(), &info);
        download.resolve(info).await.unwrap();
        let peer: BitSet = [2].into_iter().collect();

        let block = download
            .with_pieces(|pieces| pieces.picker.next_block(&peer))
            .flatten()
            .unwrap();
        let corrupt = BlockData {
            piece: 2,
            offset: 0,
            data: vec![0; block.length],
        };
        download.receive_block(corrupt).await.unwrap();

        assert_eq!(download.stats().bytes_completed, 0);
        feed_piece(&download, &data, 2).await;
        assert_eq!(download.stats().bytes_completed, (PIECE_SIZE / 2) as u64);
    }

    #[tokio::test]
    async fn unrequested_blocks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (data, info) = content();
        let download = download(dir.path(), &info);
        download.resolve(info).await.unwrap();

        let block_data = BlockData {
            piece: 0,
            offset: 0,
            data: data[..16 * 1024].to_vec(),
        };
        download.receive_block(block_data).await.unwrap();

        assert_eq!(download.stats().bytes_completed, 0);
    }

    #[tokio::test]
    async fn metadata_from_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (_, info) = content();
        let download = download(dir.path(), &info);
        let size = info.metadata.len();

        let piece = download.next_metadata_request(size).unwrap();
        assert_eq!(download.metadata_piece(0), None);
        download
            .metadata_received(piece, info.metadata.clone())
            .await
            .unwrap();

        download.info_resolved().await;
        assert_eq!(download.info().unwrap().info_hash, info.info_hash);
        assert_eq!(download.next_metadata_request(size), None);
        assert_eq!(download.metadata_piece(0), Some((size, info.metadata.clone())));
        assert_eq!(download.metadata_piece(1), None);
    }

    #[tokio::test]
    async fn metadata_with_wrong_hash_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (_, info) = content();
        let download = download(dir.path(), &info);
        let mut forged = info.metadata.clone();
        let last = forged.len() - 2;
        forged[last] ^= 0xff;

        let piece = download.next_metadata_request(forged.len()).unwrap();
        download.metadata_received(piece, forged).await.unwrap();

        assert!(download.info().is_none());
        assert_eq!(download.next_metadata_request(info.metadata.len()), Some(0));
    }

    #[tokio::test]
    async fn known_peers_are_queued_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_, info) = content();
        let download = download(dir.path(), &info);
        let peer1: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let peer2: SocketAddr = "127.0.0.2:6881".parse().unwrap();

        download.add_peers(&[peer1, peer2, peer1]);
        download.add_peers(&[peer2]);

        assert_eq!(download.next_candidate().await, peer1);
        assert_eq!(download.next_candidate().await, peer2);
        assert!(lock(&download.candidates).queue.is_empty());
    }

    #[tokio::test]
    async fn duplicate_peer_registration() {
        let dir = tempfile::tempdir().unwrap();
        let (_, info) = content();
        let download = download(dir.path(), &info);
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let handle = download.register_peer(addr);
        assert!(handle.is_some());
        assert!(download.register_peer(addr).is_none());
        assert_eq!(download.stats().active_peers, 1);
        download.unregister_peer(&addr);
        assert_eq!(download.stats().active_peers, 0);
    }

    #[test]
    fn announce_retry_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let (_, info) = content();
        let download = download(dir.path(), &info);

        assert_eq!(download.retry_delay(1), Duration::from_secs(15));
        assert_eq!(download.retry_delay(2), Duration::from_secs(30));
        assert_eq!(download.retry_delay(3), Duration::from_secs(60));
        assert_eq!(download.retry_delay(20), MAX_ANNOUNCE_RETRY);
    }
}
