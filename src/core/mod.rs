mod peer_id;
mod transfer_rate;

use std::fmt;
use std::io::{Result, Write};

use sha1::Digest;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bencoding::Value;

pub use peer_id::PeerId;
pub use transfer_rate::TransferRate;

/// A trait for messages that can be encoded into a stream.
pub trait Encoder {
    /// Encodes a message into a stream.
    fn encode(&self, out: &mut impl Write) -> Result<()>;
}

/// A trait for messages that can be encoded into an async stream.
pub trait AsyncEncoder {
    /// Encodes a message into an async stream.
    async fn encode<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()>;
}

/// A trait for messages that can be decoded from a stream.
pub trait AsyncDecoder: Sized {
    /// Decodes a message from a stream.
    async fn decode<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self>;
}

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
pub struct Sha1(pub [u8; 20]);

impl Sha1 {
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_hex(hex: &str) -> anyhow::Result<Self> {
        let mut bytes = [0; 20];
        hex::decode_to_slice(hex, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Hash of the canonical encoding, which is how info hashes are defined.
impl From<&Value> for Sha1 {
    fn from(value: &Value) -> Self {
        Self::digest(&value.to_bytes())
    }
}

impl fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1({})", self.to_hex())
    }
}

impl fmt::Display for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
