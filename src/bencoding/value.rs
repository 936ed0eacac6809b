use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Error, Result, anyhow};

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Value {
    /// Byte string, not necessarily valid utf8
    String(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(string: &str) -> Self {
        Self::String(string.as_bytes().to_vec())
    }

    pub fn list() -> Self {
        Self::List(Vec::new())
    }

    pub fn dictionary() -> Self {
        Self::Dictionary(BTreeMap::new())
    }

    pub fn with_value(mut self, value: Value) -> Self {
        if let Self::List(values) = &mut self {
            values.push(value);
        }
        self
    }

    pub fn with_entry(mut self, key: &str, value: Value) -> Self {
        if let Self::Dictionary(entries) = &mut self {
            entries.insert(key.to_string(), value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dictionary(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Removes a mandatory dictionary entry.
    pub fn remove_entry(&mut self, key: &str) -> Result<Value> {
        self.try_remove_entry(key)?
            .ok_or_else(|| anyhow!("missing key {:?}", key))
    }

    /// Removes an optional dictionary entry. Fails only if `self` is not a
    /// dictionary.
    pub fn try_remove_entry(&mut self, key: &str) -> Result<Option<Value>> {
        match self {
            Self::Dictionary(entries) => Ok(entries.remove(key)),
            other => Err(anyhow!("expected dictionary, got {}", other.kind())),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::List(_) => "list",
            Self::Dictionary(_) => "dictionary",
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(bytes) => Ok(bytes),
            other => Err(anyhow!("expected string, got {}", other.kind())),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let bytes: Vec<u8> = value.try_into()?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Integer(integer) => Ok(integer),
            other => Err(anyhow!("expected integer, got {}", other.kind())),
        }
    }
}

impl TryFrom<Value> for u64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(u64::try_from(integer)?)
    }
}

impl TryFrom<Value> for usize {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(usize::try_from(integer)?)
    }
}

impl TryFrom<Value> for u16 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(u16::try_from(integer)?)
    }
}

impl TryFrom<Value> for u8 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(u8::try_from(integer)?)
    }
}

/// Durations are encoded as whole seconds
impl TryFrom<Value> for Duration {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let seconds: u64 = value.try_into()?;
        Ok(Duration::from_secs(seconds))
    }
}

impl TryFrom<Value> for Vec<Value> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::List(values) => Ok(values),
            other => Err(anyhow!("expected list, got {}", other.kind())),
        }
    }
}
