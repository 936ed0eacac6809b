use anyhow::{Result, anyhow};
use url::Url;

use crate::core::Sha1;
use crate::torrent::push_tracker;

const BTIH_PREFIX: &str = "urn:btih:";

/// A magnet link: the info hash plus optional hints for finding peers.
#[derive(Debug, PartialEq, Clone)]
pub struct Magnet {
    pub info_hash: Sha1,
    /// `dn`, shown until the metadata arrives
    pub display_name: Option<String>,
    pub trackers: Vec<Url>,
}

impl Magnet {
    pub fn parse(link: &str) -> Result<Self> {
        let url = Url::parse(link.trim())?;
        if url.scheme() != "magnet" {
            return Err(anyhow!("not a magnet link: {}", link));
        }
        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let lower = value.to_ascii_lowercase();
                    if let Some(hash) = lower.strip_prefix(BTIH_PREFIX) {
                        info_hash = Some(parse_info_hash(hash)?);
                    }
                }
                "dn" if !value.is_empty() => display_name = Some(value.into_owned()),
                "tr" => push_tracker(&mut trackers, &value),
                _ => (),
            }
        }
        let info_hash = info_hash.ok_or_else(|| anyhow!("magnet link has no btih info hash"))?;
        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }
}

/// Accepts 40 hex digits or 32 base32 characters.
fn parse_info_hash(value: &str) -> Result<Sha1> {
    match value.len() {
        40 => Sha1::from_hex(value),
        32 => decode_base32(value).ok_or_else(|| anyhow!("invalid base32 info hash {}", value)),
        other => Err(anyhow!("invalid info hash length {}", other)),
    }
}

fn decode_base32(value: &str) -> Option<Sha1> {
    let mut out = [0; 20];
    let mut written = 0;
    let mut buffer: u64 = 0;
    let mut bits = 0;
    for ch in value.bytes() {
        let digit = match ch.to_ascii_uppercase() {
            upper @ b'A'..=b'Z' => upper - b'A',
            digit @ b'2'..=b'7' => digit - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u64::from(digit);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            *out.get_mut(written)? = (buffer >> bits) as u8;
            written += 1;
        }
    }
    (written == out.len()).then_some(Sha1(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_info_hash() {
        let magnet = Magnet::parse(
            "magnet:?xt=urn:btih:C12FE1C06BBA254A9DC9F519B335AA7C1367A88A&dn=Ubuntu+ISO",
        )
        .unwrap();

        assert_eq!(
            magnet.info_hash,
            Sha1::from_hex("c12fe1c06bba254a9dc9f519b335aa7c1367a88a").unwrap()
        );
        assert_eq!(magnet.display_name.as_deref(), Some("Ubuntu ISO"));
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn base32_info_hash() {
        let zeros = Magnet::parse("magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        let ones = Magnet::parse("magnet:?xt=urn:btih:77777777777777777777777777777777").unwrap();

        assert_eq!(zeros.info_hash, Sha1([0; 20]));
        assert_eq!(ones.info_hash, Sha1([0xff; 20]));
    }

    #[test]
    fn trackers_are_decoded() {
        let magnet = Magnet::parse(
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a\
             &tr=udp%3A%2F%2Ftracker.example%3A1337%2Fannounce\
             &tr=http%3A%2F%2Ftracker.example%2Fannounce",
        )
        .unwrap();

        let trackers: Vec<_> = magnet.trackers.iter().map(Url::as_str).collect();
        assert_eq!(
            trackers,
            vec![
                "udp://tracker.example:1337/announce",
                "http://tracker.example/announce"
            ]
        );
    }

    #[test]
    fn missing_info_hash() {
        assert!(Magnet::parse("magnet:?dn=foo").is_err());
        assert!(Magnet::parse("magnet:?xt=urn:btih:1234").is_err());
    }

    #[test]
    fn not_a_magnet() {
        assert!(Magnet::parse("http://example.com/foo.torrent").is_err());
    }
}
