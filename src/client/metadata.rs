use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::message::METADATA_PIECE_SIZE;

/// Metadata larger than this is refused outright
const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;
/// A piece requested longer ago than this may be asked from another peer
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Assembles the `info` dictionary of a magnet download from 16 KiB pieces
/// sent by peers.
#[derive(Debug, Default)]
pub struct MetadataAssembler {
    size: Option<usize>,
    pieces: Vec<Piece>,
}

#[derive(Debug, Clone, Default)]
enum Piece {
    #[default]
    Missing,
    Requested(Instant),
    Received(Vec<u8>),
}

impl MetadataAssembler {
    /// Learns the metadata size from a peer's extension handshake. The first
    /// plausible size wins.
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        match self.size {
            Some(known) if known == size => Ok(()),
            Some(known) => Err(anyhow!("metadata size {} differs from {}", size, known)),
            None if size == 0 || size > MAX_METADATA_SIZE => {
                Err(anyhow!("implausible metadata size {}", size))
            }
            None => {
                self.size = Some(size);
                self.pieces = vec![Piece::Missing; size.div_ceil(METADATA_PIECE_SIZE)];
                Ok(())
            }
        }
    }

    /// Picks a piece to request and marks it as requested.
    pub fn next_request(&mut self, now: Instant) -> Option<usize> {
        let piece = self.pieces.iter().position(|piece| match piece {
            Piece::Missing => true,
            Piece::Requested(at) => now.duration_since(*at) >= REQUEST_TIMEOUT,
            Piece::Received(_) => false,
        })?;
        self.pieces[piece] = Piece::Requested(now);
        Some(piece)
    }

    /// Makes a piece requestable again, e.g. after the peer rejected it.
    pub fn release(&mut self, piece: usize) {
        if let Some(state @ Piece::Requested(_)) = self.pieces.get_mut(piece) {
            *state = Piece::Missing;
        }
    }

    /// Stores a received piece. Returns the whole metadata once every piece
    /// is present.
    pub fn add(&mut self, piece: usize, data: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let size = self.size.ok_or_else(|| anyhow!("metadata size unknown"))?;
        let expected = METADATA_PIECE_SIZE.min(size.saturating_sub(piece * METADATA_PIECE_SIZE));
        let state = self
            .pieces
            .get_mut(piece)
            .ok_or_else(|| anyhow!("invalid metadata piece {}", piece))?;
        if data.len() != expected {
            return Err(anyhow!(
                "metadata piece {} has {} bytes, expected {}",
                piece,
                data.len(),
                expected
            ));
        }
        *state = Piece::Received(data);

        if !self
            .pieces
            .iter()
            .all(|piece| matches!(piece, Piece::Received(_)))
        {
            return Ok(None);
        }
        let mut metadata = Vec::with_capacity(size);
        for piece in std::mem::take(&mut self.pieces) {
            if let Piece::Received(data) = piece {
                metadata.extend(data);
            }
        }
        self.size = None;
        Ok(Some(metadata))
    }

    /// Forgets everything, e.g. after the assembled metadata failed to
    /// verify.
    pub fn reset(&mut self) {
        self.size = None;
        self.pieces.clear();
    }
}
