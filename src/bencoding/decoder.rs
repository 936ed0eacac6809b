use std::{
    collections::BTreeMap,
    io::{Error, ErrorKind, Result},
};

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

use crate::bencoding::value::Value;
use crate::core::AsyncDecoder;

const BUFFER_SIZE: usize = 1024 * 8;

impl AsyncDecoder for Value {
    async fn decode<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let mut parser = Parser::new();
        let mut buf = [0; BUFFER_SIZE];
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            for byte in &buf[0..read] {
                parser.consume(*byte)?;
            }
        }
        parser.result()
    }
}

impl Value {
    /// Decodes a complete value from memory, trailing whitespace allowed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut parser = Parser::new();
        for byte in bytes {
            parser.consume(*byte)?;
        }
        parser.result()
    }

    /// Decodes the value at the start of `bytes` and returns it along with
    /// the number of bytes it occupied. Anything after it is left untouched.
    pub fn from_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut parser = Parser::new();
        for byte in bytes {
            parser.consume(*byte)?;
            if parser.is_done() {
                let length = parser.position;
                return Ok((parser.result()?, length));
            }
        }
        Err(Error::new(ErrorKind::UnexpectedEof, "incomplete"))
    }
}

#[derive(Debug)]
struct Parser {
    state: State,
    stack: Vec<StackState>,
    position: usize,
}

#[derive(Debug)]
enum State {
    Ready,
    Integer(Option<i64>, i64),
    StringLength(usize),
    StringContents(Vec<u8>, usize),
    Done(Value),
}

#[derive(Debug)]
enum StackState {
    List(Vec<Value>),
    Dictionary(Option<String>, BTreeMap<String, Value>),
}

impl StackState {
    fn new_list() -> Self {
        Self::List(Vec::new())
    }

    fn new_dictionary() -> Self {
        Self::Dictionary(None, BTreeMap::new())
    }
}

impl Parser {
    fn new() -> Self {
        Self {
            state: State::Ready,
            stack: Vec::new(),
            position: 0,
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.state, State::Done(_))
    }

    fn consume(&mut self, byte: u8) -> Result<()> {
        match (&mut self.state, byte) {
            // Integer
            (State::Ready, b'i') => {
                self.state = State::Integer(None, 1);
            }
            (State::Integer(None, sign), b'-') if *sign == 1 => {
                *sign = -1;
            }
            (State::Integer(None, -1), b'0') => {
                return Err(Error::new(ErrorKind::InvalidInput, "negative zero"));
            }
            (State::Integer(Some(0), _), b'0'..=b'9') => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "leading zeros not allowed",
                ));
            }
            (State::Integer(integer, _), b'0'..=b'9') => {
                let digit = (byte - b'0') as i64;
                let next = integer
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|value| value.checked_add(digit))
                    .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "integer overflow"))?;
                *integer = Some(next);
            }
            (&mut State::Integer(Some(integer), sign), b'e') => {
                self.emit(Value::Integer(integer * sign))?;
            }

            // List
            (State::Ready, b'l') => {
                self.stack.push(StackState::new_list());
            }

            // Dictionary
            (State::Ready, b'd') => {
                self.stack.push(StackState::new_dictionary());
            }

            // String
            (State::Ready, b'0'..=b'9') => {
                let digit = (byte - b'0') as usize;
                self.state = State::StringLength(digit);
            }
            (State::StringLength(0), b'0'..=b'9') => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "leading zeros not allowed",
                ));
            }
            (State::StringLength(length), b'0'..=b'9') => {
                let digit = (byte - b'0') as usize;
                *length = length
                    .checked_mul(10)
                    .and_then(|value| value.checked_add(digit))
                    .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "string too long"))?;
            }
            (&mut State::StringLength(0), b':') => {
                self.emit(Value::String(Vec::new()))?;
            }
            (&mut State::StringLength(length), b':') => {
                let string = Vec::with_capacity(length.min(BUFFER_SIZE));
                self.state = State::StringContents(string, length);
            }
            (State::StringContents(bytes, length), _) => {
                bytes.push(byte);
                if bytes.len() == *length {
                    let string = std::mem::take(bytes);
                    self.emit(Value::String(string))?;
                }
            }

            // End collection
            (State::Ready, b'e') => match self.stack.pop() {
                Some(StackState::List(list)) => {
                    self.emit(Value::List(list))?;
                }
                Some(StackState::Dictionary(None, entries)) => {
                    self.emit(Value::Dictionary(entries))?;
                }
                Some(StackState::Dictionary(Some(key), _)) => {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!("missing value for key {:?}", key),
                    ));
                }
                None => {
                    return Err(Error::new(ErrorKind::InvalidInput, "nothing to close"));
                }
            },

            // Ignore trailing whitespace
            (State::Done(_), b'\n' | b'\r' | b' ') => return Ok(()),

            // Unexpected input
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unexpected byte 0x{byte:02x} at position {}", self.position),
                ));
            }
        }
        self.position += 1;
        Ok(())
    }

    fn emit(&mut self, value: Value) -> Result<()> {
        match (self.stack.last_mut(), value) {
            (Some(StackState::List(list)), value) => {
                list.push(value);
                self.state = State::Ready;
            }
            (Some(StackState::Dictionary(key @ None, _)), Value::String(string)) => {
                let string = String::from_utf8(string).map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidInput,
                        "dictionary key should be valid utf8",
                    )
                })?;
                *key = Some(string);
                self.state = State::Ready;
            }
            (Some(StackState::Dictionary(None, _)), _) => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "only string keys are allowed in dictionaries",
                ));
            }
            (Some(StackState::Dictionary(key, entries)), value) => {
                if let Some(key) = key.take() {
                    entries.insert(key, value);
                }
                self.state = State::Ready;
            }
            (None, value) => {
                self.state = State::Done(value);
            }
        }
        Ok(())
    }

    fn result(self) -> Result<Value> {
        match self.state {
            State::Done(value) => Ok(value),
            _ => Err(Error::new(ErrorKind::UnexpectedEof, "incomplete")),
        }
    }
}
