mod request;
mod response;
mod udp;

use anyhow::{Context, Result, anyhow};

use crate::bencoding::Value;

pub use request::{Event, TrackerRequest};
pub use response::TrackerResponse;

/// Announces to the tracker named in the request. HTTP(S) trackers are
/// reached through `client`, which carries the proxy configuration; UDP
/// trackers are always contacted directly.
pub async fn announce(client: &reqwest::Client, request: &TrackerRequest) -> Result<TrackerResponse> {
    match request.announce.scheme() {
        "http" | "https" => announce_http(client, request).await,
        "udp" => udp::announce(request)
            .await
            .with_context(|| format!("udp announce to {} failed", request.announce)),
        other => Err(anyhow!("unsupported tracker scheme {:?}", other)),
    }
}

async fn announce_http(client: &reqwest::Client, request: &TrackerRequest) -> Result<TrackerResponse> {
    let response = client.get(request.url()).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("server returned status {}", response.status()));
    }
    let body = response.bytes().await?;
    let value = Value::from_bytes(&body).context("invalid tracker response")?;
    TrackerResponse::try_from(value)
}
