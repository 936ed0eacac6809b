mod block;
mod codec;
mod extension;
mod handshake;

use std::fmt;

use bit_set::BitSet;

pub use block::*;
pub use codec::*;
pub use extension::*;
pub use handshake::*;

/// All of the remaining messages in the protocol take the form of <length prefix><message
/// ID><payload>. The length prefix is a four byte big-endian value. The message ID is a single
/// decimal byte. The payload is message dependent.
#[derive(PartialEq, Clone)]
pub enum Message {
    /// # keep-alive: <len=0000>
    ///
    /// Zero bytes, no message ID and no payload. Sent when nothing else was sent for a while so
    /// the peer does not drop an idle connection.
    KeepAlive,

    /// # choke: <len=0001><id=0>
    Choke,

    /// # unchoke: <len=0001><id=1>
    Unchoke,

    /// # interested: <len=0001><id=2>
    Interested,

    /// # not interested: <len=0001><id=3>
    NotInterested,

    /// # have: <len=0005><id=4><piece index>
    ///
    /// Zero-based index of a piece that was just downloaded and verified.
    Have(usize),

    /// # bitfield: <len=0001+X><id=5><bitfield>
    ///
    /// Only valid right after the handshake. The high bit in the first byte corresponds to piece
    /// index 0, spare bits at the end are zero. Peers without any piece may skip it.
    Bitfield(BitSet),

    /// # request: <len=0013><id=6><index><begin><length>
    Request(Block),

    /// # piece: <len=0009+X><id=7><index><begin><block>
    Piece(BlockData),

    /// # cancel: <len=0013><id=8><index><begin><length>
    Cancel(Block),

    /// # port: <len=0003><id=9><listen-port>
    ///
    /// DHT listen port of the peer. Ignored.
    Port(u16),

    /// # extended: <len=0002+X><id=20><extended id><payload>
    ///
    /// Extension protocol (BEP 10). Extended id 0 is the extension handshake, other ids are the
    /// ones announced by the receiving side in its handshake.
    Extended { id: u8, payload: Vec<u8> },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "KeepAlive"),
            Message::Choke => write!(f, "Choke"),
            Message::Unchoke => write!(f, "Unchoke"),
            Message::Interested => write!(f, "Interested"),
            Message::NotInterested => write!(f, "NotInterested"),
            Message::Have(piece) => write!(f, "Have {{ piece: {} }}", piece),
            Message::Bitfield(bitset) => write!(f, "Bitfield(<{} pieces>)", bitset.len()),
            Message::Request(block) => write!(f, "Request({:?})", block),
            Message::Piece(block) => write!(f, "Piece({:?})", block),
            Message::Cancel(block) => write!(f, "Cancel({:?})", block),
            Message::Port(port) => write!(f, "Port({})", port),
            Message::Extended { id, payload } => {
                write!(f, "Extended {{ id: {}, payload: <{} bytes> }}", id, payload.len())
            }
        }
    }
}
