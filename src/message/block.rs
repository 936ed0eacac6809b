use std::fmt;

/// A slice of a piece, as requested from or offered to a peer.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub struct Block {
    pub piece: usize,
    pub offset: usize,
    pub length: usize,
}

impl Block {
    pub fn new(piece: usize, offset: usize, length: usize) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    pub fn global_offset(&self, piece_size: usize) -> usize {
        (self.piece * piece_size) + self.offset
    }
}

#[derive(PartialEq, Clone)]
pub struct BlockData {
    pub piece: usize,
    pub offset: usize,
    pub data: Vec<u8>,
}

impl From<&BlockData> for Block {
    fn from(value: &BlockData) -> Self {
        Self::new(value.piece, value.offset, value.data.len())
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockData {{ piece: {}, offset: {}, data: <{} bytes> }}",
            self.piece,
            self.offset,
            self.data.len()
        )
    }
}
