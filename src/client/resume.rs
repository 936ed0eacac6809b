use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bit_set::BitSet;
use log::warn;

use crate::bencoding::Value;
use crate::core::Sha1;

use super::picker::to_bitfield;

/// Resume file of a download, kept next to its content.
pub fn path(data_dir: &Path, info_hash: &Sha1) -> PathBuf {
    data_dir.join(format!(".{}.resume", info_hash))
}

/// Writes the set of verified pieces. The file is replaced atomically.
pub async fn save(path: &Path, info_hash: &Sha1, pieces: &BitSet, total: usize) -> Result<()> {
    let bitfield = to_bitfield(pieces, total);
    let value = Value::dictionary()
        .with_entry("info-hash", Value::String(info_hash.0.to_vec()))
        .with_entry("pieces", Value::String(bitfield.get_ref().to_bytes()));
    let temp = path.with_extension("resume.tmp");
    tokio::fs::write(&temp, value.to_bytes())
        .await
        .with_context(|| format!("unable to write {}", temp.display()))?;
    tokio::fs::rename(&temp, path)
        .await
        .with_context(|| format!("unable to write {}", path.display()))?;
    Ok(())
}

/// Reads back previously verified pieces. A missing, foreign or unreadable
/// file yields no pieces.
pub async fn load(path: &Path, info_hash: &Sha1, total: usize) -> BitSet {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return BitSet::new(),
        Err(err) => {
            warn!("unable to read resume data {}: {}", path.display(), err);
            return BitSet::new();
        }
    };
    match decode(&bytes, info_hash, total) {
        Ok(pieces) => pieces,
        Err(err) => {
            warn!("ignoring resume data {}: {:#}", path.display(), err);
            BitSet::new()
        }
    }
}

fn decode(bytes: &[u8], info_hash: &Sha1, total: usize) -> Result<BitSet> {
    let mut value = Value::from_bytes(bytes)?;
    let stored: Vec<u8> = value.remove_entry("info-hash")?.try_into()?;
    if stored != info_hash.0 {
        anyhow::bail!("resume data belongs to another torrent");
    }
    let bitfield: Vec<u8> = value.remove_entry("pieces")?.try_into()?;
    if bitfield.len() != total.div_ceil(8) {
        anyhow::bail!("bitfield has {} bytes for {} pieces", bitfield.len(), total);
    }
    Ok(to_bitfield(&BitSet::from_bytes(&bitfield), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_carries_info_hash() {
        let info_hash = Sha1([0xab; 20]);

        assert_eq!(
            path(Path::new("/data"), &info_hash),
            PathBuf::from(format!("/data/.{}.resume", "ab".repeat(20)))
        );
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = Sha1([1; 20]);
        let path = path(dir.path(), &info_hash);
        let pieces: BitSet = [0, 3, 9].into_iter().collect();

        save(&path, &info_hash, &pieces, 10).await.unwrap();
        let loaded = load(&path, &info_hash, 10).await;

        assert_eq!(loaded.iter().collect::<Vec<_>>(), vec![0, 3, 9]);
        assert!(!path.with_extension("resume.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_has_no_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = Sha1([1; 20]);

        let loaded = load(&path(dir.path(), &info_hash), &info_hash, 10).await;

        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn ignore_resume_data_of_other_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let path = path(dir.path(), &Sha1([1; 20]));
        let pieces: BitSet = [0].into_iter().collect();
        save(&path, &Sha1([1; 20]), &pieces, 10).await.unwrap();

        assert!(load(&path, &Sha1([2; 20]), 10).await.is_empty());
        assert!(load(&path, &Sha1([1; 20]), 100).await.is_empty());
    }

    #[tokio::test]
    async fn ignore_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = Sha1([1; 20]);
        let path = path(dir.path(), &info_hash);
        tokio::fs::write(&path, b"garbage").await.unwrap();

        assert!(load(&path, &info_hash, 10).await.is_empty());
    }
}
