mod joiner;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::core::Sha1;
use crate::torrent::Info;

pub use joiner::{Joiner, Status};

/// Maps the contiguous content of a download onto its files under the
/// storage root.
#[derive(Debug)]
pub struct Storage {
    files: Vec<FileSpan>,
    total_size: u64,
}

#[derive(Debug)]
struct FileSpan {
    path: PathBuf,
    offset: u64,
    size: u64,
}

impl FileSpan {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

impl Storage {
    pub fn new(root: &Path, info: &Info) -> Self {
        let mut offset = 0;
        let mut files = Vec::new();
        for file in info.download_type.files() {
            let size = file.size as u64;
            files.push(FileSpan {
                path: root.join(&file.path),
                offset,
                size,
            });
            offset += size;
        }
        Self {
            files,
            total_size: offset,
        }
    }

    /// Creates every file (and its parent directories) at its final size.
    /// Existing content is kept.
    pub async fn allocate(&self) -> Result<()> {
        for file in &self.files {
            if let Some(parent) = file.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("unable to create {}", parent.display()))?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&file.path)
                .await
                .with_context(|| format!("unable to open {}", file.path.display()))?;
            if handle.metadata().await?.len() != file.size {
                handle.set_len(file.size).await?;
            }
        }
        Ok(())
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut written = 0;
        for (file, file_offset, length) in self.spans(offset, data.len())? {
            let mut handle = OpenOptions::new()
                .write(true)
                .truncate(false)
                .open(&file.path)
                .await
                .with_context(|| format!("unable to open {}", file.path.display()))?;
            handle.seek(SeekFrom::Start(file_offset)).await?;
            handle.write_all(&data[written..written + length]).await?;
            handle.flush().await?;
            written += length;
        }
        Ok(())
    }

    pub async fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; length];
        let mut read = 0;
        for (file, file_offset, span_length) in self.spans(offset, length)? {
            let mut handle = File::open(&file.path)
                .await
                .with_context(|| format!("unable to open {}", file.path.display()))?;
            handle.seek(SeekFrom::Start(file_offset)).await?;
            handle.read_exact(&mut data[read..read + span_length]).await?;
            read += span_length;
        }
        Ok(data)
    }

    /// Reads a piece back from disk and checks it against its hash. Missing
    /// files or short reads count as not verified.
    pub async fn verify_piece(&self, info: &Info, piece: usize) -> bool {
        let Some(expected) = info.pieces.get(piece) else {
            return false;
        };
        let offset = info.piece_offset(piece) as u64;
        match self.read(offset, info.piece_size(piece)).await {
            Ok(data) => Sha1::digest(&data) == *expected,
            Err(_) => false,
        }
    }

    /// Splits `[offset, offset + length)` into per-file ranges:
    /// (file, offset within the file, length).
    fn spans(&self, offset: u64, length: usize) -> Result<Vec<(&FileSpan, u64, usize)>> {
        let end = offset + length as u64;
        if end > self.total_size {
            return Err(anyhow!(
                "range {}..{} exceeds content size {}",
                offset,
                end,
                self.total_size
            ));
        }
        Ok(self
            .files
            .iter()
            .filter(|file| file.size > 0 && file.offset < end && file.end() > offset)
            .map(|file| {
                let start = offset.max(file.offset);
                let stop = end.min(file.end());
                (file, start - file.offset, (stop - start) as usize)
            })
            .collect())
    }
}
