//! UDP tracker protocol (BEP 15). Always dialed directly, proxies only
//! cover TCP.

use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use url::Url;

use crate::tracker::TrackerRequest;
use crate::tracker::request::NUM_WANT;
use crate::tracker::response::{TrackerResponse, compact_v4, compact_v6};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const CONNECT_LEN: usize = 16;
const ANNOUNCE_HEADER_LEN: usize = 20;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const MAX_PACKET: usize = 2048;
const ATTEMPTS: usize = 2;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(8);

pub async fn announce(request: &TrackerRequest) -> Result<TrackerResponse> {
    let addr = resolve(&request.announce).await?;
    let bind = if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let connection_id = connect(&socket).await?;
    let transaction_id = rand::random();
    let packet = announce_packet(connection_id, transaction_id, request);
    let response = round_trip(&socket, &packet).await?;
    parse_announce(&response, transaction_id, addr.is_ipv6())
}

async fn resolve(url: &Url) -> Result<SocketAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "udp tracker without host"))?;
    let port = url
        .port()
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "udp tracker without port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("unable to resolve {}", host)))
}

async fn connect(socket: &UdpSocket) -> Result<u64> {
    let transaction_id: u32 = rand::random();
    let mut packet = BytesMut::with_capacity(CONNECT_LEN);
    packet.put_u64(PROTOCOL_ID);
    packet.put_u32(ACTION_CONNECT);
    packet.put_u32(transaction_id);

    let response = round_trip(socket, &packet).await?;
    let mut response = check_header(&response, ACTION_CONNECT, transaction_id, CONNECT_LEN)?;
    Ok(response.get_u64())
}

fn announce_packet(connection_id: u64, transaction_id: u32, request: &TrackerRequest) -> BytesMut {
    let mut packet = BytesMut::with_capacity(ANNOUNCE_REQUEST_LEN);
    packet.put_u64(connection_id);
    packet.put_u32(ACTION_ANNOUNCE);
    packet.put_u32(transaction_id);
    packet.put_slice(&request.info_hash.0);
    packet.put_slice(&request.peer_id.0);
    packet.put_u64(request.downloaded);
    packet.put_u64(request.left);
    packet.put_u64(request.uploaded);
    packet.put_u32(request.event.map_or(0, |event| event.code()));
    packet.put_u32(0); // IP address, default
    packet.put_u32(rand::random()); // key
    packet.put_u32(NUM_WANT);
    packet.put_u16(request.port);
    packet
}

async fn round_trip(socket: &UdpSocket, packet: &[u8]) -> Result<Vec<u8>> {
    let mut buf = vec![0; MAX_PACKET];
    for _ in 0..ATTEMPTS {
        socket.send(packet).await?;
        if let Ok(read) = timeout(ATTEMPT_TIMEOUT, socket.recv(&mut buf)).await {
            buf.truncate(read?);
            return Ok(buf);
        }
    }
    Err(Error::new(ErrorKind::TimedOut, "udp tracker did not respond"))
}

/// Validates action and transaction id and returns the rest of the packet.
fn check_header(
    response: &[u8],
    expected_action: u32,
    transaction_id: u32,
    min_length: usize,
) -> Result<&[u8]> {
    let mut buf = response;
    if buf.len() < 8 {
        return Err(Error::new(ErrorKind::InvalidData, "udp tracker response too short"));
    }
    let action = buf.get_u32();
    if buf.get_u32() != transaction_id {
        return Err(Error::new(ErrorKind::InvalidData, "transaction id mismatch"));
    }
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(buf);
        return Err(Error::other(format!("tracker failure: {}", message)));
    }
    if action != expected_action || response.len() < min_length {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("unexpected udp tracker action {}", action),
        ));
    }
    Ok(buf)
}

fn parse_announce(response: &[u8], transaction_id: u32, ipv6: bool) -> Result<TrackerResponse> {
    let mut buf = check_header(response, ACTION_ANNOUNCE, transaction_id, ANNOUNCE_HEADER_LEN)?;
    let interval = Duration::from_secs(buf.get_u32() as u64);
    let incomplete = buf.get_u32() as usize;
    let complete = buf.get_u32() as usize;
    let peers = if ipv6 {
        compact_v6(buf)
    } else {
        compact_v4(buf)
    }
    .map_err(|err| Error::new(ErrorKind::InvalidData, err.to_string()))?;
    Ok(TrackerResponse {
        interval,
        complete: Some(complete),
        incomplete: Some(incomplete),
        tracker_id: None,
        warning: None,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::request::tests::request;

    /// Answers one connect and one announce like a real tracker would.
    async fn fake_tracker(socket: UdpSocket, announce_reply: impl Fn(u32) -> Vec<u8>) -> Vec<u8> {
        let mut buf = vec![0; MAX_PACKET];
        let (read, peer) = socket.recv_from(&mut buf).await.unwrap();
        let mut connect = &buf[..read];
        assert_eq!(connect.get_u64(), PROTOCOL_ID);
        assert_eq!(connect.get_u32(), ACTION_CONNECT);
        let transaction_id = connect.get_u32();
        let mut reply = BytesMut::new();
        reply.put_u32(ACTION_CONNECT);
        reply.put_u32(transaction_id);
        reply.put_u64(0xdead_beef);
        socket.send_to(&reply, peer).await.unwrap();

        let (read, peer) = socket.recv_from(&mut buf).await.unwrap();
        let announce = buf[..read].to_vec();
        let transaction_id = (&announce[12..16]).get_u32();
        socket
            .send_to(&announce_reply(transaction_id), peer)
            .await
            .unwrap();
        announce
    }

    #[tokio::test]
    async fn announce_over_udp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let tracker = tokio::spawn(fake_tracker(socket, |transaction_id| {
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_ANNOUNCE);
            reply.put_u32(transaction_id);
            reply.put_u32(1800);
            reply.put_u32(5);
            reply.put_u32(7);
            reply.put_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
            reply.to_vec()
        }));

        let request = request(&format!("udp://{}/announce", addr));
        let response = announce(&request).await.unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.incomplete, Some(5));
        assert_eq!(response.complete, Some(7));
        assert_eq!(response.peers, vec!["10.0.0.1:6881".parse().unwrap()]);

        let sent = tracker.await.unwrap();
        assert_eq!(sent.len(), ANNOUNCE_REQUEST_LEN);
        let mut sent = &sent[..];
        assert_eq!(sent.get_u64(), 0xdead_beef);
        assert_eq!(sent.get_u32(), ACTION_ANNOUNCE);
        sent.advance(4);
        assert_eq!(&sent[..20], &request.info_hash.0);
        sent.advance(40);
        assert_eq!(sent.get_u64(), 20); // downloaded
        assert_eq!(sent.get_u64(), 30); // left
        assert_eq!(sent.get_u64(), 10); // uploaded
        assert_eq!(sent.get_u32(), 2); // started
    }

    #[tokio::test]
    async fn tracker_error_message() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(fake_tracker(socket, |transaction_id| {
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_ERROR);
            reply.put_u32(transaction_id);
            reply.put_slice(b"torrent not registered");
            reply.to_vec()
        }));

        let request = request(&format!("udp://{}/announce", addr));
        let err = announce(&request).await.unwrap_err();

        assert_eq!(err.to_string(), "tracker failure: torrent not registered");
    }

    #[test]
    fn reject_mismatched_transaction() {
        let mut response = BytesMut::new();
        response.put_u32(ACTION_ANNOUNCE);
        response.put_u32(1);
        response.put_slice(&[0; 12]);

        assert!(parse_announce(&response, 2, false).is_err());
    }
}
