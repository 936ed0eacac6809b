use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Error, Result, anyhow};

use crate::bencoding::Value;

/// Used when the tracker does not say how often to announce
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, PartialEq)]
pub struct TrackerResponse {
    pub interval: Duration,
    /// Number of seeders, when reported
    pub complete: Option<usize>,
    /// Number of leechers, when reported
    pub incomplete: Option<usize>,
    pub tracker_id: Option<String>,
    pub warning: Option<String>,
    pub peers: Vec<SocketAddr>,
}

impl TryFrom<Value> for TrackerResponse {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        if let Some(reason) = value.try_remove_entry("failure reason")? {
            let reason: Vec<u8> = reason.try_into()?;
            return Err(anyhow!(
                "tracker failure: {}",
                String::from_utf8_lossy(&reason)
            ));
        }
        let interval = match value.try_remove_entry("interval")? {
            Some(interval) => interval.try_into()?,
            None => DEFAULT_INTERVAL,
        };
        let complete = value.try_remove_entry("complete")?.map(usize::try_from).transpose()?;
        let incomplete = value
            .try_remove_entry("incomplete")?
            .map(usize::try_from)
            .transpose()?;
        let tracker_id = value
            .try_remove_entry("tracker id")?
            .map(String::try_from)
            .transpose()?;
        let warning = value
            .try_remove_entry("warning message")?
            .map(String::try_from)
            .transpose()?;

        let mut peers = Vec::new();
        match value.try_remove_entry("peers")? {
            Some(Value::String(compact)) => peers.extend(compact_v4(&compact)?),
            Some(Value::List(list)) => {
                for peer in list {
                    peers.push(dictionary_peer(peer)?);
                }
            }
            Some(_) => return Err(anyhow!("invalid peers")),
            None => (),
        }
        if let Some(compact) = value.try_remove_entry("peers6")? {
            let compact: Vec<u8> = compact.try_into()?;
            peers.extend(compact_v6(&compact)?);
        }

        Ok(TrackerResponse {
            interval,
            complete,
            incomplete,
            tracker_id,
            warning,
            peers,
        })
    }
}

fn dictionary_peer(mut value: Value) -> Result<SocketAddr> {
    let port = value.remove_entry("port")?.try_into()?;
    let ip: String = value.remove_entry("ip")?.try_into()?;
    let ip: IpAddr = ip.parse()?;
    Ok(SocketAddr::new(ip, port))
}

/// 4 bytes address followed by 2 bytes port, both in network byte order.
pub fn compact_v4(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(anyhow!("invalid compact peers length {}", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// 16 bytes address followed by 2 bytes port.
pub fn compact_v6(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 18 != 0 {
        return Err(anyhow!("invalid compact peers6 length {}", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect())
}
