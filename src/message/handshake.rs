use std::io::{Error, ErrorKind, Result};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{AsyncDecoder, AsyncEncoder, PeerId, Sha1};

const PROTOCOL: &str = "BitTorrent protocol";
/// Bit 20 counted from the right, in reserved byte 5 (BEP 10)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// The handshake is a required message and must be the first message transmitted by the client. It
/// is (49+len(pstr)) bytes long.
///
/// _handshake: <pstrlen><pstr><reserved><info\_hash><peer\_id>_
///
/// * **pstrlen**: string length of <pstr>, as a single raw byte
/// * **pstr**: string identifier of the protocol
/// * **reserved**: eight reserved bytes, each bit announcing a protocol extension
/// * **info\_hash**: 20-byte SHA1 hash of the info key in the metainfo file
/// * **peer\_id**: 20-byte string used as a unique ID for the client
///
/// The initiator of a connection transmits its handshake immediately. The recipient answers once
/// it sees an info hash it is serving, and drops the connection otherwise.
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    pub protocol: String,
    pub reserved: [u8; 8],
    pub info_hash: Sha1,
    pub peer_id: PeerId,
}

impl Handshake {
    /// A handshake announcing support for the extension protocol.
    pub fn new(info_hash: Sha1, peer_id: PeerId) -> Self {
        let mut reserved = [0; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            protocol: PROTOCOL.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn is_standard_protocol(&self) -> bool {
        self.protocol == PROTOCOL
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }
}

impl AsyncDecoder for Handshake {
    async fn decode<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let protocol = {
            let length = stream.read_u8().await?;
            let mut buf = vec![0; length as usize];
            stream.read_exact(&mut buf).await?;
            String::from_utf8(buf).map_err(|err| Error::new(ErrorKind::InvalidData, err))?
        };
        let mut reserved = [0; 8];
        stream.read_exact(&mut reserved).await?;
        let info_hash = {
            let mut buf = [0; 20];
            stream.read_exact(&mut buf).await?;
            Sha1(buf)
        };
        let peer_id = {
            let mut buf = [0; 20];
            stream.read_exact(&mut buf).await?;
            PeerId(buf)
        };
        Ok(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }
}

impl AsyncEncoder for Handshake {
    async fn encode<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let len = u8::try_from(self.protocol.len())
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "protocol string too long"))?;
        stream.write_u8(len).await?;
        stream.write_all(self.protocol.as_bytes()).await?;
        stream.write_all(&self.reserved).await?;
        stream.write_all(&self.info_hash.0).await?;
        stream.write_all(&self.peer_id.0).await?;
        stream.flush().await?;
        Ok(())
    }
}
