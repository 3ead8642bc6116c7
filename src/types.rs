use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

use crate::error::NanonisError;

/// Numeric format code used for both request arguments and response fields.
///
/// Tags follow the Nanonis TCP protocol documentation (big-endian, fixed width).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireType {
    #[serde(rename = "h")]
    I16,
    #[serde(rename = "H")]
    U16,
    #[serde(rename = "i")]
    I32,
    #[serde(rename = "I")]
    U32,
    #[serde(rename = "f")]
    F32,
    #[serde(rename = "d")]
    F64,
    /// Single-byte string field. Never embedded in a request body.
    #[serde(rename = "s")]
    Str,
}

impl WireType {
    pub const ALL: [WireType; 7] = [
        WireType::I16,
        WireType::U16,
        WireType::I32,
        WireType::U32,
        WireType::F32,
        WireType::F64,
        WireType::Str,
    ];

    /// Encoded width in bytes
    pub fn width(self) -> usize {
        match self {
            WireType::I16 | WireType::U16 => 2,
            WireType::I32 | WireType::U32 | WireType::F32 => 4,
            WireType::F64 => 8,
            WireType::Str => 1,
        }
    }

    pub fn tag(self) -> char {
        match self {
            WireType::I16 => 'h',
            WireType::U16 => 'H',
            WireType::I32 => 'i',
            WireType::U32 => 'I',
            WireType::F32 => 'f',
            WireType::F64 => 'd',
            WireType::Str => 's',
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            WireType::I16 | WireType::U16 | WireType::I32 | WireType::U32
        )
    }

    /// Coerce a textual argument into a value of this type.
    ///
    /// Strings pass through verbatim, integer tags parse as (range-checked)
    /// integers, float tags parse as floating point.
    pub fn parse_arg(self, token: &str) -> Result<NanonisValue, NanonisError> {
        let invalid = |expected: &str| {
            NanonisError::InvalidArgument(format!(
                "'{token}' is not a valid {expected} ('{}')",
                self.tag()
            ))
        };

        let value = match self {
            WireType::Str => NanonisValue::String(token.to_string()),
            WireType::I16 => NanonisValue::I16(token.trim().parse().map_err(|_| invalid("i16"))?),
            WireType::U16 => NanonisValue::U16(token.trim().parse().map_err(|_| invalid("u16"))?),
            WireType::I32 => NanonisValue::I32(token.trim().parse().map_err(|_| invalid("i32"))?),
            WireType::U32 => NanonisValue::U32(token.trim().parse().map_err(|_| invalid("u32"))?),
            WireType::F32 => NanonisValue::F32(token.trim().parse().map_err(|_| invalid("f32"))?),
            WireType::F64 => NanonisValue::F64(token.trim().parse().map_err(|_| invalid("f64"))?),
        };
        Ok(value)
    }

    /// Append the big-endian encoding of `value` to `buffer`.
    pub fn encode(self, value: &NanonisValue, buffer: &mut Vec<u8>) -> Result<(), NanonisError> {
        match (self, value) {
            (WireType::I16, NanonisValue::I16(v)) => buffer.write_i16::<BigEndian>(*v)?,
            (WireType::U16, NanonisValue::U16(v)) => buffer.write_u16::<BigEndian>(*v)?,
            (WireType::I32, NanonisValue::I32(v)) => buffer.write_i32::<BigEndian>(*v)?,
            (WireType::U32, NanonisValue::U32(v)) => buffer.write_u32::<BigEndian>(*v)?,
            (WireType::F32, NanonisValue::F32(v)) => buffer.write_f32::<BigEndian>(*v)?,
            (WireType::F64, NanonisValue::F64(v)) => buffer.write_f64::<BigEndian>(*v)?,
            (WireType::Str, NanonisValue::String(s)) => {
                buffer.push(s.as_bytes().first().copied().unwrap_or(0));
            }
            _ => {
                return Err(NanonisError::Type(format!(
                    "Cannot encode {value:?} as '{}'",
                    self.tag()
                )));
            }
        }
        Ok(())
    }

    /// Read one value of this type from `reader`.
    pub fn decode(self, reader: &mut impl Read) -> Result<NanonisValue, NanonisError> {
        let value = match self {
            WireType::I16 => NanonisValue::I16(reader.read_i16::<BigEndian>()?),
            WireType::U16 => NanonisValue::U16(reader.read_u16::<BigEndian>()?),
            WireType::I32 => NanonisValue::I32(reader.read_i32::<BigEndian>()?),
            WireType::U32 => NanonisValue::U32(reader.read_u32::<BigEndian>()?),
            WireType::F32 => NanonisValue::F32(reader.read_f32::<BigEndian>()?),
            WireType::F64 => NanonisValue::F64(reader.read_f64::<BigEndian>()?),
            WireType::Str => {
                let byte = reader.read_u8()?;
                let text = String::from_utf8_lossy(&[byte])
                    .trim_end_matches('\0')
                    .to_string();
                NanonisValue::String(text)
            }
        };
        Ok(value)
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NanonisValue {
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    F32(f32),
    F64(f64),
    String(String),
}

impl From<f32> for NanonisValue {
    fn from(value: f32) -> Self {
        NanonisValue::F32(value)
    }
}

impl From<f64> for NanonisValue {
    fn from(value: f64) -> Self {
        NanonisValue::F64(value)
    }
}

impl From<u16> for NanonisValue {
    fn from(value: u16) -> Self {
        NanonisValue::U16(value)
    }
}

impl From<u32> for NanonisValue {
    fn from(value: u32) -> Self {
        NanonisValue::U32(value)
    }
}

impl From<i16> for NanonisValue {
    fn from(value: i16) -> Self {
        NanonisValue::I16(value)
    }
}

impl From<i32> for NanonisValue {
    fn from(value: i32) -> Self {
        NanonisValue::I32(value)
    }
}

impl From<String> for NanonisValue {
    fn from(value: String) -> Self {
        NanonisValue::String(value)
    }
}

impl NanonisValue {
    /// Numeric value widened to f64, regardless of wire width
    pub fn as_f64(&self) -> Result<f64, NanonisError> {
        match self {
            NanonisValue::I16(v) => Ok(f64::from(*v)),
            NanonisValue::U16(v) => Ok(f64::from(*v)),
            NanonisValue::I32(v) => Ok(f64::from(*v)),
            NanonisValue::U32(v) => Ok(f64::from(*v)),
            NanonisValue::F32(v) => Ok(f64::from(*v)),
            NanonisValue::F64(v) => Ok(*v),
            NanonisValue::String(_) => {
                Err(NanonisError::Type(format!("Expected number, got {self:?}")))
            }
        }
    }

    pub fn as_i64(&self) -> Result<i64, NanonisError> {
        match self {
            NanonisValue::I16(v) => Ok(i64::from(*v)),
            NanonisValue::U16(v) => Ok(i64::from(*v)),
            NanonisValue::I32(v) => Ok(i64::from(*v)),
            NanonisValue::U32(v) => Ok(i64::from(*v)),
            _ => Err(NanonisError::Type(format!("Expected integer, got {self:?}"))),
        }
    }

    pub fn as_str(&self) -> Result<&str, NanonisError> {
        match self {
            NanonisValue::String(s) => Ok(s),
            _ => Err(NanonisError::Type(format!("Expected string, got {self:?}"))),
        }
    }
}

impl fmt::Display for NanonisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NanonisValue::I16(v) => write!(f, "{v}"),
            NanonisValue::U16(v) => write!(f, "{v}"),
            NanonisValue::I32(v) => write!(f, "{v}"),
            NanonisValue::U32(v) => write!(f, "{v}"),
            NanonisValue::F32(v) => write!(f, "{v:e}"),
            NanonisValue::F64(v) => write!(f, "{v:e}"),
            NanonisValue::String(s) => write!(f, "{s}"),
        }
    }
}

/// Field name used for the text reply of an external interface
pub const REPLY_FIELD: &str = "Reply";

/// Named response fields, in the order the command declares them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedResponse {
    fields: Vec<(String, NanonisValue)>,
}

impl DecodedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(reply: impl Into<String>) -> Self {
        let mut response = Self::new();
        response.push(REPLY_FIELD, NanonisValue::String(reply.into()));
        response
    }

    pub fn push(&mut self, name: impl Into<String>, value: NanonisValue) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&NanonisValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Look up a numeric field, failing with a decode error if it is absent
    pub fn f64_field(&self, name: &str) -> Result<f64, NanonisError> {
        self.get(name)
            .ok_or_else(|| NanonisError::Decode(format!("Response has no field '{name}'")))?
            .as_f64()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NanonisValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl fmt::Display for DecodedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{name}': {value}")?;
        }
        write!(f, "}}")
    }
}
