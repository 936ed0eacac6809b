//! Extension protocol handshake (BEP 10) and the metadata exchange carried
//! over it (BEP 9).

use anyhow::{Result, anyhow};

use crate::bencoding::Value;

/// Extended message id of the extension handshake itself
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;
/// The id peers must use when sending us `ut_metadata` messages
pub const LOCAL_UT_METADATA_ID: u8 = 1;
/// Metadata is exchanged in pieces of 16 KiB, the last one may be shorter
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

const UT_METADATA: &str = "ut_metadata";
const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

#[derive(Debug, PartialEq, Clone, Default)]
pub struct ExtendedHandshake {
    /// Id the sender wants `ut_metadata` messages to carry, `None` if unsupported
    pub ut_metadata: Option<u8>,
    pub metadata_size: Option<usize>,
}

impl ExtendedHandshake {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut extensions = Value::dictionary();
        if let Some(id) = self.ut_metadata {
            extensions = extensions.with_entry(UT_METADATA, Value::Integer(id.into()));
        }
        let mut value = Value::dictionary().with_entry("m", extensions);
        if let Some(size) = self.metadata_size {
            value = value.with_entry("metadata_size", Value::Integer(size as i64));
        }
        value.to_bytes()
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let (mut value, _) = Value::from_prefix(payload)?;
        let ut_metadata = match value.try_remove_entry("m")? {
            Some(mut extensions) => match extensions.try_remove_entry(UT_METADATA)? {
                // Id 0 means the extension is disabled
                Some(id) => Some(u8::try_from(id)?).filter(|id| *id != 0),
                None => None,
            },
            None => None,
        };
        let metadata_size = value
            .try_remove_entry("metadata_size")?
            .map(usize::try_from)
            .transpose()?;
        Ok(Self {
            ut_metadata,
            metadata_size,
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum MetadataMessage {
    Request {
        piece: usize,
    },
    Data {
        piece: usize,
        total_size: usize,
        data: Vec<u8>,
    },
    Reject {
        piece: usize,
    },
}

impl MetadataMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let (msg_type, piece) = match self {
            Self::Request { piece } => (MSG_REQUEST, piece),
            Self::Data { piece, .. } => (MSG_DATA, piece),
            Self::Reject { piece } => (MSG_REJECT, piece),
        };
        let mut value = Value::dictionary()
            .with_entry("msg_type", Value::Integer(msg_type))
            .with_entry("piece", Value::Integer(*piece as i64));
        if let Self::Data { total_size, .. } = self {
            value = value.with_entry("total_size", Value::Integer(*total_size as i64));
        }
        let mut bytes = value.to_bytes();
        if let Self::Data { data, .. } = self {
            bytes.extend_from_slice(data);
        }
        bytes
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let (mut value, length) = Value::from_prefix(payload)?;
        let msg_type: i64 = value.remove_entry("msg_type")?.try_into()?;
        let piece = value.remove_entry("piece")?.try_into()?;
        match msg_type {
            MSG_REQUEST => Ok(Self::Request { piece }),
            MSG_DATA => {
                let total_size = value.remove_entry("total_size")?.try_into()?;
                Ok(Self::Data {
                    piece,
                    total_size,
                    data: payload[length..].to_vec(),
                })
            }
            MSG_REJECT => Ok(Self::Reject { piece }),
            other => Err(anyhow!("unknown metadata message type {}", other)),
        }
    }
}
