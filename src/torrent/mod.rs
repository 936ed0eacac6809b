mod download_type;
mod info;
mod magnet;

use std::path::Path;

use anyhow::{Context, Error, Result, anyhow};
use log::warn;
use url::Url;

use crate::bencoding::Value;

pub use download_type::DownloadType;
#[cfg(test)]
pub use download_type::File;
pub use info::Info;
pub use magnet::Magnet;

// https://wiki.theory.org/BitTorrentSpecification#Metainfo_File_Structure

#[derive(Debug, PartialEq, Clone)]
pub struct Torrent {
    /// `announce` followed by every `announce-list` entry, without duplicates
    pub trackers: Vec<Url>,
    pub info: Info,
}

impl Torrent {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("unable to read {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = Value::from_bytes(bytes).context("invalid metainfo encoding")?;
        Self::try_from(value)
    }
}

impl TryFrom<Value> for Torrent {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let mut trackers = Vec::new();
        if let Some(announce) = value.try_remove_entry("announce")? {
            let announce: String = announce.try_into()?;
            push_tracker(&mut trackers, &announce);
        }
        if let Some(tiers) = value.try_remove_entry("announce-list")? {
            let tiers: Vec<Value> = tiers.try_into()?;
            for tier in tiers {
                let tier: Vec<Value> = tier.try_into()?;
                for tracker in tier {
                    let tracker: String = tracker.try_into()?;
                    push_tracker(&mut trackers, &tracker);
                }
            }
        }
        let info = value.remove_entry("info")?.try_into()?;
        Ok(Torrent { trackers, info })
    }
}

/// Adds a tracker URL unless it is malformed or already known.
pub fn push_tracker(trackers: &mut Vec<Url>, tracker: &str) {
    match Url::parse(tracker) {
        Ok(url) if !trackers.contains(&url) => trackers.push(url),
        Ok(_) => (),
        Err(err) => warn!("ignoring invalid tracker {:?}: {}", tracker, err),
    }
}

/// Fetches a metainfo file over HTTP(S).
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Torrent> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("unable to fetch {}", url))?;
    if !response.status().is_success() {
        return Err(anyhow!("server returned status {}", response.status()));
    }
    let bytes = response.bytes().await?;
    Torrent::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::core::Sha1;

    fn info() -> Value {
        let mut pieces = Vec::with_capacity(40);
        pieces.extend_from_slice(&[1; 20]);
        pieces.extend_from_slice(&[2; 20]);
        Value::dictionary()
            .with_entry("piece length", Value::Integer(4096))
            .with_entry("pieces", Value::String(pieces))
            .with_entry("name", Value::string("image.iso"))
            .with_entry("length", Value::Integer(5678))
    }

    #[test]
    fn valid_torrent_metainfo() {
        let metainfo = Value::dictionary()
            .with_entry(
                "announce",
                Value::string("udp://tracker.opentrackr.org:1337/announce"),
            )
            .with_entry("info", info());

        let torrent = Torrent::try_from(metainfo).expect("invalid metainfo");

        assert_eq!(
            torrent.trackers[0].to_string(),
            "udp://tracker.opentrackr.org:1337/announce"
        );
        assert_eq!(torrent.info.piece_size, 4096);
        assert_eq!(torrent.info.pieces, vec![Sha1([1; 20]), Sha1([2; 20])]);
        assert_eq!(
            torrent.info.download_type,
            DownloadType::SingleFile {
                name: "image.iso".to_string(),
                size: 5678
            }
        );
    }

    #[test]
    fn announce_list_is_merged() {
        let metainfo = Value::dictionary()
            .with_entry("announce", Value::string("http://a.example/announce"))
            .with_entry(
                "announce-list",
                Value::list()
                    .with_value(Value::list().with_value(Value::string("http://a.example/announce")))
                    .with_value(
                        Value::list()
                            .with_value(Value::string("udp://b.example:80"))
                            .with_value(Value::string("not a url")),
                    ),
            )
            .with_entry("info", info());

        let torrent = Torrent::try_from(metainfo).unwrap();

        let trackers: Vec<_> = torrent.trackers.iter().map(Url::as_str).collect();
        assert_eq!(
            trackers,
            vec!["http://a.example/announce", "udp://b.example:80"]
        );
    }

    #[test]
    fn trackers_are_optional() {
        let metainfo = Value::dictionary().with_entry("info", info());

        let torrent = Torrent::try_from(metainfo).unwrap();

        assert!(torrent.trackers.is_empty());
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("image.torrent");
        let metainfo = Value::dictionary().with_entry("info", info());
        std::fs::write(&path, metainfo.to_bytes()).unwrap();

        let torrent = Torrent::load(&path).await.unwrap();

        assert_eq!(torrent.info.name(), "image.iso");
    }

    #[tokio::test]
    async fn fetch_over_http() {
        let server = MockServer::start().await;
        let metainfo = Value::dictionary().with_entry("info", info());
        Mock::given(method("GET"))
            .and(path("/image.torrent"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(metainfo.to_bytes()))
            .mount(&server)
            .await;

        let url = format!("{}/image.torrent", server.uri());
        let torrent = fetch(&reqwest::Client::new(), &url).await.unwrap();

        assert_eq!(torrent.info.total_size(), 5678);
    }

    #[tokio::test]
    async fn fetch_fails_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = format!("{}/missing.torrent", server.uri());

        assert!(fetch(&reqwest::Client::new(), &url).await.is_err());
    }
}
