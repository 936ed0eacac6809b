use std::io::{Result, Write};

use crate::bencoding::value::Value;
use crate::core::Encoder;

impl Encoder for Value {
    fn encode(&self, dest: &mut impl Write) -> Result<()> {
        match self {
            Self::String(string) => encode_string(string, dest),
            Self::Integer(integer) => write!(dest, "i{}e", integer),
            Self::List(values) => {
                dest.write_all(b"l")?;
                for value in values {
                    value.encode(dest)?;
                }
                dest.write_all(b"e")
            }
            Self::Dictionary(entries) => {
                dest.write_all(b"d")?;
                for (key, value) in entries {
                    encode_string(key.as_bytes(), dest)?;
                    value.encode(dest)?;
                }
                dest.write_all(b"e")
            }
        }
    }
}

impl Value {
    /// Canonical encoding: dictionary keys are written in sorted order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.encode(&mut buffer);
        buffer
    }
}

fn encode_string(string: &[u8], dest: &mut impl Write) -> Result<()> {
    write!(dest, "{}:", string.len())?;
    dest.write_all(string)
}
