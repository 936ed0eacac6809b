use std::collections::HashMap;

use anyhow::{Result, anyhow};

use crate::core::Sha1;
use crate::message::BlockData;
use crate::torrent::Info;

/// Collects the blocks of pieces in flight and verifies every piece once its
/// last block arrives.
pub struct Joiner {
    block_size: usize,
    piece_size: usize,
    total_size: usize,
    hashes: Vec<Sha1>,
    pieces: HashMap<usize, PieceState>,
}

impl Joiner {
    pub fn new(info: &Info, block_size: usize) -> Self {
        Self {
            block_size,
            piece_size: info.piece_size,
            total_size: info.total_size(),
            hashes: info.pieces.clone(),
            pieces: HashMap::new(),
        }
    }

    /// Adds a block received from a peer. Blocks that do not line up with
    /// the piece layout are rejected.
    pub fn add(&mut self, block_data: BlockData) -> Result<Status> {
        let BlockData {
            piece,
            offset,
            data,
        } = block_data;
        let sha1 = *self
            .hashes
            .get(piece)
            .ok_or_else(|| anyhow!("invalid piece {}", piece))?;
        let size = self.size_of(piece);
        let block = offset / self.block_size;
        let expected_length = self.block_size.min(size.saturating_sub(offset));
        if offset % self.block_size != 0 || offset >= size || data.len() != expected_length {
            return Err(anyhow!(
                "block at offset {} with length {} does not fit piece {}",
                offset,
                data.len(),
                piece
            ));
        }

        let block_size = self.block_size;
        let state = self
            .pieces
            .entry(piece)
            .or_insert_with(|| PieceState::new(size, block_size, sha1));
        let status = state.add(block, data);
        if status != Status::Incomplete {
            self.pieces.remove(&piece);
        }
        Ok(match status {
            Status::Complete { data, .. } => Status::Complete {
                offset: (piece * self.piece_size) as u64,
                data,
            },
            other => other,
        })
    }

    fn size_of(&self, piece: usize) -> usize {
        let start = piece * self.piece_size;
        (start + self.piece_size).min(self.total_size) - start
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    Incomplete,
    Invalid,
    Complete { offset: u64, data: Vec<u8> },
}

struct PieceState {
    size: usize,
    sha1: Sha1,
    data: Vec<Option<Vec<u8>>>,
}

impl PieceState {
    fn new(size: usize, block_size: usize, sha1: Sha1) -> Self {
        let blocks = size.div_ceil(block_size);
        Self {
            size,
            sha1,
            data: vec![None; blocks],
        }
    }

    fn add(&mut self, block: usize, data: Vec<u8>) -> Status {
        if let Some(slot) = self.data.get_mut(block) {
            *slot = Some(data);
        }

        if self.data.iter().any(Option::is_none) {
            return Status::Incomplete;
        }

        let mut piece_data = Vec::with_capacity(self.size);
        for block_data in self.data.iter_mut().filter_map(Option::take) {
            piece_data.extend(block_data);
        }

        if Sha1::digest(&piece_data) == self.sha1 {
            Status::Complete {
                offset: 0,
                data: piece_data,
            }
        } else {
            Status::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::DownloadType;

    fn info(total_size: usize, piece_size: usize, pieces: Vec<Sha1>) -> Info {
        Info {
            info_hash: Sha1([0; 20]),
            piece_size,
            pieces,
            download_type: DownloadType::SingleFile {
                name: "foo".to_string(),
                size: total_size,
            },
            metadata: Vec::new(),
        }
    }

    fn block(piece: usize, offset: usize, data: Vec<u8>) -> BlockData {
        BlockData {
            piece,
            offset,
            data,
        }
    }

    #[test]
    fn piece_complete() {
        let data = [vec![0; 4], vec![1; 4]].concat();
        let mut joiner = Joiner::new(&info(16, 8, vec![Sha1::digest(&data), Sha1([0; 20])]), 4);

        assert_eq!(joiner.add(block(0, 0, vec![0; 4])).unwrap(), Status::Incomplete);
        assert_eq!(
            joiner.add(block(0, 4, vec![1; 4])).unwrap(),
            Status::Complete { offset: 0, data }
        );
    }

    #[test]
    fn piece_complete_but_invalid() {
        let mut joiner = Joiner::new(&info(16, 8, vec![Sha1([0; 20]), Sha1([0; 20])]), 4);

        assert_eq!(joiner.add(block(0, 0, vec![0; 4])).unwrap(), Status::Incomplete);
        assert_eq!(joiner.add(block(0, 4, vec![0; 4])).unwrap(), Status::Invalid);
    }

    #[test]
    fn piece_is_reset_after_invalidation() {
        let mut joiner = Joiner::new(&info(8, 8, vec![Sha1::digest(&[0; 8])]), 4);

        assert_eq!(joiner.add(block(0, 0, vec![1; 4])).unwrap(), Status::Incomplete);
        assert_eq!(joiner.add(block(0, 4, vec![1; 4])).unwrap(), Status::Invalid);

        assert_eq!(joiner.add(block(0, 0, vec![0; 4])).unwrap(), Status::Incomplete);
        assert!(matches!(
            joiner.add(block(0, 4, vec![0; 4])).unwrap(),
            Status::Complete { .. }
        ));
    }

    #[test]
    fn last_piece_has_fewer_blocks() {
        let mut joiner = Joiner::new(
            &info(36, 24, vec![Sha1::digest(&[0; 24]), Sha1::digest(&[0; 12])]),
            8,
        );

        assert_eq!(joiner.add(block(1, 0, vec![0; 8])).unwrap(), Status::Incomplete);
        assert!(matches!(
            joiner.add(block(1, 8, vec![0; 4])).unwrap(),
            Status::Complete { offset: 24, .. }
        ));
    }

    #[test]
    fn add_blocks_out_of_order() {
        let data = vec![1, 1, 2, 2, 3, 3];
        let mut joiner = Joiner::new(&info(6, 6, vec![Sha1::digest(&data)]), 2);

        assert_eq!(joiner.add(block(0, 0, vec![1; 2])).unwrap(), Status::Incomplete);
        assert_eq!(joiner.add(block(0, 4, vec![3; 2])).unwrap(), Status::Incomplete);
        assert_eq!(
            joiner.add(block(0, 2, vec![2; 2])).unwrap(),
            Status::Complete { offset: 0, data }
        );
    }

    #[test]
    fn reject_misaligned_blocks() {
        let mut joiner = Joiner::new(&info(16, 8, vec![Sha1([0; 20]), Sha1([0; 20])]), 4);

        assert!(joiner.add(block(0, 2, vec![0; 4])).is_err());
        assert!(joiner.add(block(0, 0, vec![0; 3])).is_err());
        assert!(joiner.add(block(0, 8, vec![0; 4])).is_err());
        assert!(joiner.add(block(2, 0, vec![0; 4])).is_err());
    }
}
