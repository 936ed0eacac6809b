use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use bit_set::BitSet;
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, interval, timeout};
use tokio_util::codec::Framed;

use crate::client::config::Config;
use crate::client::download::{Download, PeerHandle};
use crate::core::{AsyncDecoder, AsyncEncoder};
use crate::message::{
    Block, BlockData, EXTENDED_HANDSHAKE_ID, ExtendedHandshake, Handshake, LOCAL_UT_METADATA_ID,
    Message, MessageCodec, MetadataMessage,
};

/// Large enough for a bitfield of a quarter million pieces
const MAX_MESSAGE_LENGTH: usize = 256 * 1024;
/// Larger requests are refused
const MAX_REQUEST_LENGTH: usize = 128 * 1024;
const TICK: Duration = Duration::from_secs(5);

type Frames<S> = Framed<S, MessageCodec>;

/// Runs a connection to one peer until either side drops it. `handshake` is
/// the peer's handshake when it connected to us.
pub async fn run<S>(
    download: Arc<Download>,
    mut socket: S,
    addr: SocketAddr,
    handshake: Option<Handshake>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = Arc::clone(download.config());
    let ours = Handshake::new(download.info_hash(), config.client_id);
    let theirs = timeout(
        config.handshake_timeout,
        exchange_handshakes(&mut socket, ours, handshake),
    )
    .await
    .map_err(|_| anyhow!("handshake timed out"))??;
    let handle = download
        .register_peer(addr)
        .ok_or_else(|| anyhow!("already connected"))?;
    debug!("[{}] connected to {:?}", addr, theirs.peer_id);

    let mut session = Session::new(download, config, addr, handle, theirs.supports_extensions());
    let frames = Framed::new(socket, MessageCodec::new(MAX_MESSAGE_LENGTH));
    session.run(frames).await
}

async fn exchange_handshakes<S>(
    socket: &mut S,
    ours: Handshake,
    received: Option<Handshake>,
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ours.encode(socket).await?;
    let theirs = match received {
        // Incoming connection, the peer went first
        Some(theirs) => theirs,
        None => Handshake::decode(socket).await?,
    };
    if theirs.info_hash != ours.info_hash {
        bail!("info hash mismatch");
    }
    if !theirs.is_standard_protocol() {
        bail!("invalid handshake protocol: {}", theirs.protocol);
    }
    if theirs.peer_id == ours.peer_id {
        bail!("connected to ourselves");
    }
    Ok(theirs)
}

struct Session {
    download: Arc<Download>,
    config: Arc<Config>,
    addr: SocketAddr,
    handle: Arc<PeerHandle>,
    extensions: bool,
    peer_pieces: BitSet,
    /// Whether `peer_pieces` is counted in the picker's availability
    registered: bool,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    in_flight: HashMap<Block, Instant>,
    /// Id the peer wants its `ut_metadata` messages to carry
    ut_metadata: Option<u8>,
    metadata_size: Option<usize>,
    metadata_request: Option<(usize, Instant)>,
    last_sent: Instant,
    last_received: Instant,
}

impl Session {
    fn new(
        download: Arc<Download>,
        config: Arc<Config>,
        addr: SocketAddr,
        handle: Arc<PeerHandle>,
        extensions: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            download,
            config,
            addr,
            handle,
            extensions,
            peer_pieces: BitSet::new(),
            registered: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            in_flight: HashMap::new(),
            ut_metadata: None,
            metadata_size: None,
            metadata_request: None,
            last_sent: now,
            last_received: now,
        }
    }

    async fn run<S>(&mut self, mut frames: Frames<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cancel = self.download.cancel_token();
        let mut haves = self.download.subscribe_haves();
        let mut info_ready = self.download.subscribe_info();
        let mut wanted = self.download.subscribe_wanted();
        let mut unchoke = self.handle.unchoke.subscribe();
        let mut tick = interval(TICK);

        self.greet(&mut frames).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = frames.next() => match message {
                    Some(Ok(message)) => {
                        self.last_received = Instant::now();
                        self.handle_message(&mut frames, message).await?;
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        debug!("[{}] connection closed", self.addr);
                        break;
                    }
                },
                Ok(piece) = haves.recv() => {
                    self.send(&mut frames, Message::Have(piece)).await?;
                    self.update_interest(&mut frames).await?;
                }
                Ok(()) = info_ready.changed() => {
                    self.register();
                    self.update_interest(&mut frames).await?;
                }
                Ok(()) = wanted.changed() => self.update_interest(&mut frames).await?,
                Ok(()) = unchoke.changed() => {
                    let unchoked = *unchoke.borrow_and_update();
                    self.set_choking(&mut frames, !unchoked).await?;
                }
                _ = tick.tick() => self.on_tick(&mut frames).await?,
            }
        }
        frames.flush().await?;
        Ok(())
    }

    /// Bitfield first, then the extension handshake.
    async fn greet<S>(&mut self, frames: &mut Frames<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let bitfield = self
            .download
            .with_pieces(|pieces| pieces.picker.bitfield());
        if let Some(bitfield) = bitfield.filter(|bitfield| !bitfield.is_empty()) {
            self.send(frames, Message::Bitfield(bitfield)).await?;
        }
        if self.extensions {
            let handshake = ExtendedHandshake {
                ut_metadata: Some(LOCAL_UT_METADATA_ID),
                metadata_size: self.download.info().map(|info| info.metadata.len()),
            };
            let message = Message::Extended {
                id: EXTENDED_HANDSHAKE_ID,
                payload: handshake.to_bytes(),
            };
            self.send(frames, message).await?;
        }
        self.register();
        Ok(())
    }

    async fn handle_message<S>(&mut self, frames: &mut Frames<S>, message: Message) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("[{}] < {:?}", self.addr, message);
        match message {
            Message::KeepAlive | Message::Cancel(_) | Message::Port(_) => (),
            Message::Choke => {
                self.peer_choking = true;
                // Requests are discarded by a choking peer
                self.release_requests();
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.request_blocks(frames).await?;
            }
            Message::Interested => self.handle.interested.store(true, Ordering::Relaxed),
            Message::NotInterested => self.handle.interested.store(false, Ordering::Relaxed),
            Message::Have(piece) => {
                if self.peer_pieces.insert(piece) && self.registered {
                    self.download.with_pieces(|pieces| pieces.picker.peer_has(piece));
                }
                self.update_interest(frames).await?;
            }
            Message::Bitfield(bitfield) => {
                self.unregister();
                self.peer_pieces = bitfield;
                self.register();
                self.update_interest(frames).await?;
            }
            Message::Request(block) => self.serve(frames, block).await?,
            Message::Piece(block_data) => self.receive(frames, block_data).await?,
            Message::Extended { id, payload } => {
                self.handle_extended(frames, id, &payload).await?
            }
        }
        Ok(())
    }

    async fn handle_extended<S>(&mut self, frames: &mut Frames<S>, id: u8, payload: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match id {
            EXTENDED_HANDSHAKE_ID => {
                let handshake = ExtendedHandshake::from_bytes(payload)?;
                self.ut_metadata = handshake.ut_metadata;
                self.metadata_size = handshake.metadata_size;
                self.request_metadata(frames).await?;
            }
            LOCAL_UT_METADATA_ID => match MetadataMessage::from_bytes(payload)? {
                MetadataMessage::Request { piece } => {
                    let Some(id) = self.ut_metadata else {
                        return Ok(());
                    };
                    let reply = match self.download.metadata_piece(piece) {
                        Some((total_size, data)) => MetadataMessage::Data {
                            piece,
                            total_size,
                            data,
                        },
                        None => MetadataMessage::Reject { piece },
                    };
                    let payload = reply.to_bytes();
                    self.send(frames, Message::Extended { id, payload }).await?;
                }
                MetadataMessage::Data { piece, data, .. } => {
                    self.metadata_request = None;
                    self.download.metadata_received(piece, data).await?;
                    self.request_metadata(frames).await?;
                }
                MetadataMessage::Reject { piece } => {
                    debug!("[{}] rejected metadata piece {}", self.addr, piece);
                    self.metadata_request = None;
                    self.download.metadata_rejected(piece);
                }
            },
            other => debug!("[{}] ignoring extended message {}", self.addr, other),
        }
        Ok(())
    }

    /// Asks the peer for one metadata piece at a time while the metadata is
    /// unknown.
    async fn request_metadata<S>(&mut self, frames: &mut Frames<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.metadata_request.is_some() {
            return Ok(());
        }
        let (Some(id), Some(size)) = (self.ut_metadata, self.metadata_size) else {
            return Ok(());
        };
        let Some(piece) = self.download.next_metadata_request(size) else {
            return Ok(());
        };
        self.metadata_request = Some((piece, Instant::now()));
        let payload = MetadataMessage::Request { piece }.to_bytes();
        self.send(frames, Message::Extended { id, payload }).await
    }

    async fn serve<S>(&mut self, frames: &mut Frames<S>, block: Block) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.am_choking || self.config.no_upload {
            debug!("[{}] ignoring request while choked: {:?}", self.addr, block);
            return Ok(());
        }
        if block.length == 0 || block.length > MAX_REQUEST_LENGTH {
            bail!("invalid request length {}", block.length);
        }
        let Some((info, storage)) = self.download.ready() else {
            return Ok(());
        };
        if block.piece >= info.total_pieces()
            || block.offset + block.length > info.piece_size(block.piece)
        {
            bail!("request out of bounds: {:?}", block);
        }
        let have = self
            .download
            .with_pieces(|pieces| pieces.picker.has_piece(block.piece))
            .unwrap_or(false);
        if !have {
            return Ok(());
        }

        let offset = block.global_offset(info.piece_size) as u64;
        let data = storage.read(offset, block.length).await?;
        if let Some(limiter) = &self.config.limits.upload {
            limiter.acquire(block.length as u64).await;
        }
        let block_data = BlockData {
            piece: block.piece,
            offset: block.offset,
            data,
        };
        let bytes = block.length as u64;
        self.handle.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.download.record_uploaded(bytes);
        self.send(frames, Message::Piece(block_data)).await
    }

    async fn receive<S>(&mut self, frames: &mut Frames<S>, block_data: BlockData) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let block = Block::from(&block_data);
        if self.in_flight.remove(&block).is_none() {
            debug!("[{}] unrequested block {:?}", self.addr, block);
            return Ok(());
        }
        let bytes = block.length as u64;
        if let Some(limiter) = &self.config.limits.download {
            limiter.acquire(bytes).await;
        }
        self.handle.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.download.receive_block(block_data).await?;
        self.request_blocks(frames).await
    }

    /// Keeps the request pipeline full while the peer lets us download.
    async fn request_blocks<S>(&mut self, frames: &mut Frames<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.peer_choking || !self.am_interested {
            return Ok(());
        }
        while self.in_flight.len() < self.config.max_requests_per_peer {
            let peer_pieces = &self.peer_pieces;
            let next = self
                .download
                .with_pieces(|pieces| pieces.picker.next_block(peer_pieces))
                .flatten();
            let Some(block) = next else {
                break;
            };
            self.in_flight.insert(block, Instant::now());
            frames.feed(Message::Request(block)).await?;
        }
        frames.flush().await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn update_interest<S>(&mut self, frames: &mut Frames<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_pieces = &self.peer_pieces;
        let interested = self.download.is_wanted()
            && self
                .download
                .with_pieces(|pieces| pieces.picker.is_interesting(peer_pieces))
                .unwrap_or(false);
        if interested != self.am_interested {
            self.am_interested = interested;
            let message = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.send(frames, message).await?;
        }
        self.request_blocks(frames).await
    }

    async fn set_choking<S>(&mut self, frames: &mut Frames<S>, choke: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if choke == self.am_choking || (!choke && self.config.no_upload) {
            return Ok(());
        }
        self.am_choking = choke;
        let message = if choke {
            Message::Choke
        } else {
            Message::Unchoke
        };
        self.send(frames, message).await
    }

    async fn on_tick<S>(&mut self, frames: &mut Frames<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.last_received.elapsed() > self.config.keep_alive_interval * 2 {
            bail!("peer idle");
        }

        let timeout = self.config.request_timeout;
        let expired: Vec<Block> = self
            .in_flight
            .iter()
            .filter(|(_, requested)| requested.elapsed() > timeout)
            .map(|(block, _)| *block)
            .collect();
        if !expired.is_empty() {
            debug!("[{}] {} requests timed out", self.addr, expired.len());
            for block in &expired {
                self.in_flight.remove(block);
            }
            self.download.with_pieces(|pieces| {
                for block in &expired {
                    pieces.picker.release(block);
                }
            });
            self.request_blocks(frames).await?;
        }

        if let Some((piece, requested)) = self.metadata_request {
            if requested.elapsed() > timeout {
                self.metadata_request = None;
                self.download.metadata_rejected(piece);
            }
        }
        self.request_metadata(frames).await?;

        if self.last_sent.elapsed() >= self.config.keep_alive_interval {
            self.send(frames, Message::KeepAlive).await?;
        }
        Ok(())
    }

    async fn send<S>(&mut self, frames: &mut Frames<S>, message: Message) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("[{}] > {:?}", self.addr, message);
        frames.send(message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Counts the peer's pieces towards availability once the metadata is
    /// known.
    fn register(&mut self) {
        if self.registered {
            return;
        }
        let peer_pieces = &self.peer_pieces;
        self.registered = self
            .download
            .with_pieces(|pieces| pieces.picker.peer_joined(peer_pieces))
            .is_some();
    }

    fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        let peer_pieces = &self.peer_pieces;
        self.download
            .with_pieces(|pieces| pieces.picker.peer_left(peer_pieces));
        self.registered = false;
    }

    fn release_requests(&mut self) {
        let blocks: Vec<Block> = self.in_flight.drain().map(|(block, _)| block).collect();
        self.download.with_pieces(|pieces| {
            for block in &blocks {
                pieces.picker.release(block);
            }
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release_requests();
        self.unregister();
        self.download.unregister_peer(&self.addr);
    }
}
