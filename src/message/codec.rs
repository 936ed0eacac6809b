use std::io::{Error, ErrorKind, Result};

use bit_set::BitSet;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Block, BlockData, Message};

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;
const ID_EXTENDED: u8 = 20;
const LENGTH_SIZE: usize = 4;

/// Frames peer wire messages. Frames longer than `max_length` are rejected
/// before they are buffered.
pub struct MessageCodec {
    max_length: usize,
}

impl MessageCodec {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        match item {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => put_header(dst, 1, ID_CHOKE),
            Message::Unchoke => put_header(dst, 1, ID_UNCHOKE),
            Message::Interested => put_header(dst, 1, ID_INTERESTED),
            Message::NotInterested => put_header(dst, 1, ID_NOT_INTERESTED),
            Message::Have(piece) => {
                put_header(dst, 5, ID_HAVE);
                dst.put_u32(piece as u32);
            }
            Message::Bitfield(bitset) => {
                let bytes = bitset.get_ref().to_bytes();
                put_header(dst, 1 + bytes.len(), ID_BITFIELD);
                dst.extend_from_slice(&bytes);
            }
            Message::Request(block) => {
                put_header(dst, 13, ID_REQUEST);
                encode_block(block, dst);
            }
            Message::Piece(BlockData {
                piece,
                offset,
                data,
            }) => {
                put_header(dst, 9 + data.len(), ID_PIECE);
                dst.put_u32(piece as u32);
                dst.put_u32(offset as u32);
                dst.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                put_header(dst, 13, ID_CANCEL);
                encode_block(block, dst);
            }
            Message::Port(port) => {
                put_header(dst, 3, ID_PORT);
                dst.put_u16(port);
            }
            Message::Extended { id, payload } => {
                put_header(dst, 2 + payload.len(), ID_EXTENDED);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

fn put_header(dst: &mut BytesMut, length: usize, id: u8) {
    dst.put_u32(length as u32);
    dst.put_u8(id);
}

fn encode_block(block: Block, dst: &mut BytesMut) {
    dst.put_u32(block.piece as u32);
    dst.put_u32(block.offset as u32);
    dst.put_u32(block.length as u32);
}

impl Decoder for MessageCodec {
    type Error = Error;
    type Item = Message;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_SIZE {
            // Not enough data to read length marker.
            return Ok(None);
        }

        let mut length_bytes = [0; LENGTH_SIZE];
        length_bytes.copy_from_slice(&src[0..LENGTH_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            src.advance(LENGTH_SIZE);
            return Ok(Some(Message::KeepAlive));
        }

        if length > self.max_length {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "message length {} exceeds maximum of {}",
                    length, self.max_length
                ),
            ));
        }

        if src.len() < LENGTH_SIZE + length {
            src.reserve(LENGTH_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_SIZE);
        let id = src.get_u8();
        let payload_length = length - 1;
        match (id, length) {
            (ID_CHOKE, 1) => Ok(Some(Message::Choke)),
            (ID_UNCHOKE, 1) => Ok(Some(Message::Unchoke)),
            (ID_INTERESTED, 1) => Ok(Some(Message::Interested)),
            (ID_NOT_INTERESTED, 1) => Ok(Some(Message::NotInterested)),
            (ID_HAVE, 5) => {
                let piece = src.get_u32() as usize;
                Ok(Some(Message::Have(piece)))
            }
            (ID_BITFIELD, _) => {
                let bitset = BitSet::from_bytes(&src[0..payload_length]);
                src.advance(payload_length);
                Ok(Some(Message::Bitfield(bitset)))
            }
            (ID_REQUEST, 13) => Ok(Some(Message::Request(decode_block(src)))),
            (ID_PIECE, 9..) => {
                let piece = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let data_length = length - 9;
                let data = src.split_to(data_length).to_vec();
                Ok(Some(Message::Piece(BlockData {
                    piece,
                    offset,
                    data,
                })))
            }
            (ID_CANCEL, 13) => Ok(Some(Message::Cancel(decode_block(src)))),
            (ID_PORT, 3) => Ok(Some(Message::Port(src.get_u16()))),
            (ID_EXTENDED, 2..) => {
                let id = src.get_u8();
                let payload = src.split_to(payload_length - 1).to_vec();
                Ok(Some(Message::Extended { id, payload }))
            }
            _ => {
                // Skip the unknown payload so the stream stays aligned
                src.advance(payload_length);
                Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid message id {} with length {}", id, length),
                ))
            }
        }
    }
}

fn decode_block(src: &mut BytesMut) -> Block {
    let piece = src.get_u32() as usize;
    let offset = src.get_u32() as usize;
    let length = src.get_u32() as usize;
    Block::new(piece, offset, length)
}
