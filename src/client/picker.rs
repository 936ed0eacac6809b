use std::collections::{BTreeMap, BTreeSet};

use bit_set::BitSet;

use crate::message::Block;
use crate::torrent::Info;

/// Decides which block to request next. Pieces already started are finished
/// first; new pieces are chosen rarest-first among those the peer has.
pub struct Picker {
    piece_sizes: Vec<usize>,
    block_size: usize,
    have: BitSet,
    /// Number of connected peers announcing each piece
    availability: Vec<usize>,
    /// (availability, piece) of every missing piece that is not in progress
    priorities: BTreeSet<(usize, usize)>,
    active: BTreeMap<usize, Vec<BlockState>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Open,
    Requested,
    Received,
}

impl Picker {
    pub fn new(info: &Info, block_size: usize) -> Self {
        let total = info.total_pieces();
        let piece_sizes = (0..total).map(|piece| info.piece_size(piece)).collect();
        Self {
            piece_sizes,
            block_size,
            have: BitSet::with_capacity(total),
            availability: vec![0; total],
            priorities: (0..total).map(|piece| (0, piece)).collect(),
            active: BTreeMap::new(),
        }
    }

    pub fn total_pieces(&self) -> usize {
        self.piece_sizes.len()
    }

    pub fn has_piece(&self, piece: usize) -> bool {
        self.have.contains(piece)
    }

    pub fn is_complete(&self) -> bool {
        self.have.len() == self.total_pieces()
    }

    /// Verified pieces as a bitfield of exactly the right length.
    pub fn bitfield(&self) -> BitSet {
        to_bitfield(&self.have, self.total_pieces())
    }

    /// Whether the peer has any piece we still need.
    pub fn is_interesting(&self, peer_pieces: &BitSet) -> bool {
        peer_pieces
            .iter()
            .any(|piece| piece < self.total_pieces() && !self.have.contains(piece))
    }

    pub fn peer_joined(&mut self, peer_pieces: &BitSet) {
        for piece in peer_pieces.iter() {
            self.update_availability(piece, |count| count + 1);
        }
    }

    pub fn peer_has(&mut self, piece: usize) {
        self.update_availability(piece, |count| count + 1);
    }

    pub fn peer_left(&mut self, peer_pieces: &BitSet) {
        for piece in peer_pieces.iter() {
            self.update_availability(piece, |count| count.saturating_sub(1));
        }
    }

    /// Reserves the next block to request from a peer with `peer_pieces`.
    pub fn next_block(&mut self, peer_pieces: &BitSet) -> Option<Block> {
        let started = self.active.iter().find_map(|(piece, blocks)| {
            if !peer_pieces.contains(*piece) {
                return None;
            }
            let block = blocks.iter().position(|state| *state == BlockState::Open)?;
            Some((*piece, block))
        });
        let (piece, block) = match started {
            Some(found) => found,
            None => {
                let piece = self
                    .priorities
                    .iter()
                    .map(|(_, piece)| *piece)
                    .find(|piece| peer_pieces.contains(*piece))?;
                self.start(piece);
                (piece, 0)
            }
        };
        let blocks = self.active.get_mut(&piece)?;
        blocks[block] = BlockState::Requested;
        let offset = block * self.block_size;
        let length = self.block_size.min(self.piece_sizes[piece] - offset);
        Some(Block::new(piece, offset, length))
    }

    /// Marks a requested block as received. Returns `false` for blocks
    /// nobody asked for.
    pub fn block_received(&mut self, block: &Block) -> bool {
        match self.block_state(block) {
            Some(state @ BlockState::Requested) => {
                *state = BlockState::Received;
                true
            }
            _ => false,
        }
    }

    pub fn is_requested(&mut self, block: &Block) -> bool {
        matches!(self.block_state(block), Some(BlockState::Requested))
    }

    /// Makes a requested block available again, e.g. after its peer left.
    pub fn release(&mut self, block: &Block) {
        if let Some(state @ BlockState::Requested) = self.block_state(block) {
            *state = BlockState::Open;
        }
    }

    pub fn piece_verified(&mut self, piece: usize) {
        self.active.remove(&piece);
        self.priorities.remove(&(self.availability[piece], piece));
        self.have.insert(piece);
    }

    /// Puts a piece that failed verification back in the queue.
    pub fn piece_failed(&mut self, piece: usize) {
        if self.active.remove(&piece).is_some() {
            self.priorities.insert((self.availability[piece], piece));
        }
    }

    fn start(&mut self, piece: usize) {
        self.priorities.remove(&(self.availability[piece], piece));
        let blocks = self.piece_sizes[piece].div_ceil(self.block_size);
        self.active.insert(piece, vec![BlockState::Open; blocks]);
    }

    fn block_state(&mut self, block: &Block) -> Option<&mut BlockState> {
        if block.offset % self.block_size != 0 {
            return None;
        }
        self.active
            .get_mut(&block.piece)?
            .get_mut(block.offset / self.block_size)
    }

    fn update_availability(&mut self, piece: usize, update: impl Fn(usize) -> usize) {
        let Some(count) = self.availability.get(piece).copied() else {
            return;
        };
        let queued = self.priorities.remove(&(count, piece));
        self.availability[piece] = update(count);
        if queued {
            self.priorities.insert((self.availability[piece], piece));
        }
    }
}

/// Trims or pads a set of pieces into a wire bitfield for `total` pieces.
pub fn to_bitfield(pieces: &BitSet, total: usize) -> BitSet {
    let mut bytes = vec![0u8; total.div_ceil(8)];
    for piece in pieces.iter().filter(|piece| *piece < total) {
        bytes[piece / 8] |= 0x80 >> (piece % 8);
    }
    BitSet::from_bytes(&bytes)
}
