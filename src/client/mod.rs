//! The bundled BitTorrent engine.
//!
//! A [`Client`] owns the listening socket and every [`Download`]. Each download
//! runs its own tracker announces, outbound dialing and choking; every peer
//! connection is a task driving one session.

mod choke;
mod config;
mod download;
mod metadata;
mod peer;
mod picker;
mod resume;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdListener};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{AsyncDecoder, Sha1};
use crate::engine::{Engine, EngineConfig, Source};
use crate::message::Handshake;
use crate::torrent::{self, Magnet, Torrent};

pub use config::Config;
pub use download::Download;

const PORT_RANGE: RangeInclusive<u16> = 6881..=6889;

type Downloads = Arc<Mutex<HashMap<Sha1, Arc<Download>>>>;

/// Locks a mutex, carrying on with the data of a poisoned one.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Client {
    config: Arc<Config>,
    downloads: Downloads,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Client {
    /// Creates the client. Unless uploads are disabled it listens for
    /// incoming peers on the first free port in 6881-6889.
    pub fn new(engine: EngineConfig) -> Result<Self> {
        let listener = if engine.no_upload {
            None
        } else {
            bind_listener()?
        };
        let port = match &listener {
            Some(listener) => listener.local_addr()?.port(),
            None => *PORT_RANGE.start(),
        };
        let config = Arc::new(Config::new(engine, port));
        let client = Self {
            config,
            downloads: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };
        if let Some(listener) = listener {
            info!("Listening for peers on port {}", port);
            tokio::spawn(accept_peers(
                listener,
                Arc::clone(&client.downloads),
                client.config.handshake_timeout,
                client.cancel.clone(),
            ));
        }
        Ok(client)
    }

    async fn add_download(
        &self,
        info_hash: Sha1,
        display_name: Option<String>,
        trackers: Vec<url::Url>,
        info: Option<torrent::Info>,
    ) -> Result<Arc<Download>> {
        if let Some(existing) = lock(&self.downloads).get(&info_hash) {
            return Ok(Arc::clone(existing));
        }
        let download = Download::new(
            Arc::clone(&self.config),
            info_hash,
            display_name,
            trackers,
            self.cancel.child_token(),
        );
        if let Some(info) = info {
            download.resolve(info).await?;
        }
        lock(&self.downloads).insert(info_hash, Arc::clone(&download));
        download.start();
        Ok(download)
    }
}

impl Engine for Client {
    type Transfer = Download;

    async fn add_source(&self, source: &Source) -> Result<Arc<Download>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("client is closed"));
        }
        let torrent = match source {
            Source::File(path) => Torrent::load(path).await?,
            Source::Uri(uri) if uri.starts_with("magnet:") => {
                let magnet = Magnet::parse(uri)?;
                return self
                    .add_download(magnet.info_hash, magnet.display_name, magnet.trackers, None)
                    .await;
            }
            Source::Uri(uri) if uri.starts_with("http://") || uri.starts_with("https://") => {
                torrent::fetch(self.config.transport.http_client(), uri)
                    .await
                    .with_context(|| format!("unable to fetch {}", uri))?
            }
            Source::Uri(uri) => return Err(anyhow!("unsupported source {}", uri)),
        };
        let info_hash = torrent.info.info_hash;
        self.add_download(info_hash, None, torrent.trackers, Some(torrent.info))
            .await
    }

    async fn wait_all(&self) -> bool {
        let downloads: Vec<_> = lock(&self.downloads).values().cloned().collect();
        for download in downloads {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = download.completed() => (),
            }
        }
        !self.cancel.is_cancelled()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing client...");
        self.cancel.cancel();
        let downloads: Vec<_> = lock(&self.downloads).values().cloned().collect();
        for download in downloads {
            download.shutdown().await;
        }
    }
}

fn bind_listener() -> Result<Option<TcpListener>> {
    for port in PORT_RANGE {
        match StdListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                return Ok(Some(TcpListener::from_std(listener)?));
            }
            Err(err) => debug!("port {} unavailable: {}", port, err),
        }
    }
    warn!(
        "No free port in {}-{}, incoming peers will not be accepted",
        PORT_RANGE.start(),
        PORT_RANGE.end()
    );
    Ok(None)
}

async fn accept_peers(
    listener: TcpListener,
    downloads: Downloads,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let (socket, addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("failed to accept connection: {}", err);
                    continue;
                }
            },
        };
        let downloads = Arc::clone(&downloads);
        tokio::spawn(async move {
            if let Err(err) = handle_incoming(socket, addr, &downloads, handshake_timeout).await {
                debug!("[{}] incoming connection dropped: {:#}", addr, err);
            }
        });
    }
}

async fn handle_incoming(
    mut socket: TcpStream,
    addr: SocketAddr,
    downloads: &Downloads,
    handshake_timeout: Duration,
) -> Result<()> {
    debug!("[{}] accepted connection", addr);
    let handshake = timeout(handshake_timeout, Handshake::decode(&mut socket))
        .await
        .context("handshake timed out")??;
    let download = lock(downloads)
        .get(&handshake.info_hash)
        .cloned()
        .ok_or_else(|| anyhow!("unknown info hash {}", handshake.info_hash))?;
    download.accept(socket, addr, handshake).await
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::bencoding::Value;
    use crate::engine::Transfer;

    fn engine_config(data_dir: &Path, no_upload: bool) -> EngineConfig {
        EngineConfig {
            data_dir: data_dir.to_path_buf(),
            max_peers: 4,
            no_upload,
            limits: Default::default(),
            transport: Default::default(),
        }
    }

    fn torrent_file(dir: &Path, data: &[u8]) -> std::path::PathBuf {
        let info = Value::dictionary()
            .with_entry("name", Value::string("client.bin"))
            .with_entry("length", Value::Integer(data.len() as i64))
            .with_entry("piece length", Value::Integer(16 * 1024))
            .with_entry("pieces", Value::String(Sha1::digest(data).0.to_vec()));
        let torrent = Value::dictionary().with_entry("info", info);
        let path = dir.join("client.torrent");
        std::fs::write(&path, torrent.to_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn add_torrent_file_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(engine_config(dir.path(), true)).unwrap();
        let path = torrent_file(dir.path(), b"hello");

        let download = client.add_source(&Source::File(path.clone())).await.unwrap();
        let again = client.add_source(&Source::File(path)).await.unwrap();

        assert!(Arc::ptr_eq(&download, &again));
        assert_eq!(download.name(), "client.bin");
        assert!(download.stats().has_info);
        assert_eq!(download.stats().total_length, 5);
        assert!(dir.path().join("client.bin").exists());

        client.close().await;
        client.close().await;
        assert!(!client.wait_all().await);
        assert!(client.add_source(&Source::Uri("magnet:?xt=urn:btih:".into())).await.is_err());
    }

    #[tokio::test]
    async fn resumed_download_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("client.bin"), b"hello").unwrap();
        let path = torrent_file(dir.path(), b"hello");
        let info_hash = Torrent::load(&path).await.unwrap().info.info_hash;
        let pieces = [0].into_iter().collect();
        resume::save(&resume::path(dir.path(), &info_hash), &info_hash, &pieces, 1)
            .await
            .unwrap();
        let client = Client::new(engine_config(dir.path(), true)).unwrap();

        client.add_source(&Source::File(path)).await.unwrap();

        assert!(client.wait_all().await);
        client.close().await;
    }

    #[tokio::test]
    async fn add_magnet_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(engine_config(dir.path(), true)).unwrap();
        let magnet = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=linux.iso";

        let download = client
            .add_source(&Source::Uri(magnet.to_string()))
            .await
            .unwrap();

        assert_eq!(download.name(), "linux.iso");
        assert!(!download.stats().has_info);
        client.close().await;
    }

    #[tokio::test]
    async fn reject_unsupported_sources() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(engine_config(dir.path(), true)).unwrap();

        let result = client
            .add_source(&Source::Uri("ftp://example.com/file.torrent".to_string()))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fetch_torrent_over_http() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let dir = tempfile::tempdir().unwrap();
        let file = torrent_file(dir.path(), b"hello");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/client.torrent"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(std::fs::read(file).unwrap()))
            .mount(&server)
            .await;
        let client = Client::new(engine_config(dir.path(), true)).unwrap();

        let url = format!("{}/client.torrent", server.uri());
        let download = client.add_source(&Source::Uri(url)).await.unwrap();

        assert_eq!(download.name(), "client.bin");
        client.close().await;
    }

    #[tokio::test]
    async fn accept_incoming_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = torrent_file(dir.path(), b"hello");
        let client = Client::new(engine_config(dir.path(), false)).unwrap();
        let download = client.add_source(&Source::File(path)).await.unwrap();

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, client.config.port));
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let ours = Handshake::new(download.info_hash(), crate::core::PeerId::random());
        crate::core::AsyncEncoder::encode(&ours, &mut socket)
            .await
            .unwrap();
        let theirs = Handshake::decode(&mut socket).await.unwrap();

        assert_eq!(theirs.info_hash, download.info_hash());
        client.close().await;
    }
}
