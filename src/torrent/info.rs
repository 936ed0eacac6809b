use anyhow::{Error, Result, anyhow};

use crate::bencoding::Value;
use crate::core::Sha1;
use crate::torrent::DownloadType;

const SHA1_LEN: usize = 20;

#[derive(Debug, PartialEq, Clone)]
pub struct Info {
    pub info_hash: Sha1,
    pub piece_size: usize,
    pub pieces: Vec<Sha1>,
    pub download_type: DownloadType,
    /// Encoded `info` dictionary, served to peers fetching metadata
    pub metadata: Vec<u8>,
}

impl Info {
    /// Builds the info from a metadata blob received from peers, which must
    /// hash to the expected info hash.
    pub fn from_metadata(metadata: &[u8], info_hash: Sha1) -> Result<Self> {
        let actual = Sha1::digest(metadata);
        if actual != info_hash {
            return Err(anyhow!(
                "metadata hash mismatch: expected {}, got {}",
                info_hash,
                actual
            ));
        }
        let value = Value::from_bytes(metadata)?;
        let mut info = Info::try_from(value)?;
        // Keep the exact bytes, the hash is defined over them
        info.info_hash = info_hash;
        info.metadata = metadata.to_vec();
        Ok(info)
    }

    fn build_pieces(pieces: &[u8]) -> Result<Vec<Sha1>> {
        if pieces.len() % SHA1_LEN != 0 {
            return Err(anyhow!(
                "invalid length {}. must be a multiple of {}",
                pieces.len(),
                SHA1_LEN
            ));
        }
        Ok(pieces
            .chunks_exact(SHA1_LEN)
            .map(|chunk| {
                let mut bytes = [0; SHA1_LEN];
                bytes.copy_from_slice(chunk);
                Sha1(bytes)
            })
            .collect())
    }

    pub fn name(&self) -> &str {
        self.download_type.name()
    }

    pub fn total_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_size(&self, piece: usize) -> usize {
        let piece_start = self.piece_offset(piece);
        let piece_end = (piece_start + self.piece_size).min(self.total_size());
        piece_end.saturating_sub(piece_start)
    }

    pub fn piece_offset(&self, piece: usize) -> usize {
        self.piece_size * piece
    }

    pub fn total_size(&self) -> usize {
        self.download_type.files().iter().map(|file| file.size).sum()
    }
}

impl TryFrom<Value> for Info {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let metadata = value.to_bytes();
        let info_hash = Sha1::digest(&metadata);
        let piece_size: usize = value.remove_entry("piece length")?.try_into()?;
        if piece_size == 0 {
            return Err(anyhow!("piece length must be positive"));
        }
        let pieces: Vec<u8> = value.remove_entry("pieces")?.try_into()?;
        let pieces = Info::build_pieces(&pieces)?;
        let download_type = value.try_into()?;
        let info = Info {
            info_hash,
            piece_size,
            pieces,
            download_type,
            metadata,
        };
        let expected = info.total_size().div_ceil(piece_size);
        if expected != info.total_pieces() {
            return Err(anyhow!(
                "expected {} pieces for {} bytes, got {}",
                expected,
                info.total_size(),
                info.total_pieces()
            ));
        }
        Ok(info)
    }
}
