use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::core::{PeerId, Sha1};

/// Number of peers asked for in every announce
pub const NUM_WANT: u32 = 50;

#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub announce: Url,
    pub info_hash: Sha1,
    pub peer_id: PeerId,
    /// The port number that the client is listening on. Ports reserved for BitTorrent are
    /// typically 6881-6889.
    pub port: u16,
    /// The total amount uploaded since the client sent the 'started' event.
    pub uploaded: u64,
    /// The total amount downloaded since the client sent the 'started' event.
    pub downloaded: u64,
    /// The number of bytes this client still has to download, unknown
    /// (reported as 0) while the metadata is missing.
    pub left: u64,
    pub event: Option<Event>,
    pub tracker_id: Option<String>,
}

impl TrackerRequest {
    /// The announce URL with the request parameters appended to any query
    /// the tracker URL already carries.
    pub fn url(&self) -> Url {
        let mut url = self.announce.clone();
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            url_encode(&self.info_hash.0),
            url_encode(&self.peer_id.0),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
            NUM_WANT,
        );
        if let Some(event) = &self.event {
            query.push_str("&event=");
            query.push_str(event.into());
        }
        if let Some(id) = &self.tracker_id {
            query.push_str("&trackerid=");
            query.push_str(&url_encode(id.as_bytes()));
        }
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, query),
            _ => query,
        };
        url.set_query(Some(&query));
        url
    }
}

fn url_encode(bytes: &[u8]) -> String {
    String::from_iter(byte_serialize(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The first request to the tracker must include the event key with this value.
    Started,
    /// Must be sent to the tracker if the client is shutting down gracefully.
    Stopped,
    /// Must be sent to the tracker when the download completes. However, must not be sent if the
    /// download was already 100% complete when the client started.
    Completed,
}

impl Event {
    /// Event code used by UDP trackers
    pub fn code(&self) -> u32 {
        match self {
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

impl From<&Event> for &str {
    fn from(value: &Event) -> Self {
        match value {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}
