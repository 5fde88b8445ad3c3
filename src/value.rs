//! Typed attribute values
//!
//! Values are stored as an encoding tag plus a byte blob. The tag decides
//! how the blob is decoded; a typed resolve that asks for the wrong tag
//! fails instead of reinterpreting the bytes.

use crate::error::{Aff4Error, Result};
use crate::urn::Urn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoding tag of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    /// End-of-list sentinel
    Unknown = 0,
    String = 1,
    Urn = 2,
    U16 = 3,
    U32 = 4,
    U64 = 5,
    Blob = 6,
    /// Wildcard accepted by typed resolves
    Any = 7,
}

impl ValueType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ValueType::String,
            2 => ValueType::Urn,
            3 => ValueType::U16,
            4 => ValueType::U32,
            5 => ValueType::U64,
            6 => ValueType::Blob,
            7 => ValueType::Any,
            _ => ValueType::Unknown,
        }
    }

    /// Whether a value stored with `stored` satisfies a request for `self`
    pub fn accepts(self, stored: ValueType) -> bool {
        self == ValueType::Any || self == stored
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Unknown => "unknown",
            ValueType::String => "string",
            ValueType::Urn => "urn",
            ValueType::U16 => "u16",
            ValueType::U32 => "u32",
            ValueType::U64 => "u64",
            ValueType::Blob => "blob",
            ValueType::Any => "any",
        }
    }
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Urn(Urn),
    U16(u16),
    U32(u32),
    U64(u64),
    Blob(#[serde(with = "hex_blob")] Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Urn(_) => ValueType::Urn,
            Value::U16(_) => ValueType::U16,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    /// Serialize the payload (the tag is stored separately)
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Urn(u) => u.as_str().as_bytes().to_vec(),
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::Blob(b) => b.clone(),
        }
    }

    /// Rebuild a value from its tag and payload
    pub fn decode(value_type: ValueType, bytes: &[u8]) -> Result<Self> {
        let text = |bytes: &[u8]| {
            String::from_utf8(bytes.to_vec()).map_err(|_| {
                Aff4Error::InvalidParameter(format!("{} value is not UTF-8", value_type.name()))
            })
        };

        match value_type {
            ValueType::String => Ok(Value::String(text(bytes)?)),
            ValueType::Urn => Ok(Value::Urn(Urn::new(text(bytes)?))),
            ValueType::U16 => Ok(Value::U16(u16::from_le_bytes(fixed(bytes, value_type)?))),
            ValueType::U32 => Ok(Value::U32(u32::from_le_bytes(fixed(bytes, value_type)?))),
            ValueType::U64 => Ok(Value::U64(u64::from_le_bytes(fixed(bytes, value_type)?))),
            ValueType::Blob => Ok(Value::Blob(bytes.to_vec())),
            ValueType::Unknown | ValueType::Any => Err(Aff4Error::InvalidParameter(format!(
                "cannot decode a value tagged {}",
                value_type.name()
            ))),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U16(v) => Some(*v as u64),
            Value::U32(v) => Some(*v as u64),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Urn(u) => Some(u.as_str()),
            _ => None,
        }
    }

    pub fn as_urn(&self) -> Option<&Urn> {
        match self {
            Value::Urn(u) => Some(u),
            _ => None,
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8], value_type: ValueType) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        Aff4Error::InvalidParameter(format!(
            "{} value must be {} bytes, got {}",
            value_type.name(),
            N,
            bytes.len()
        ))
    })
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Urn(u) => write!(f, "<{}>", u),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::Blob(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Urn> for Value {
    fn from(value: Urn) -> Self {
        Value::Urn(value)
    }
}

impl From<&Urn> for Value {
    fn from(value: &Urn) -> Self {
        Value::Urn(value.clone())
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::U16(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::U32(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::U64(value)
    }
}

mod hex_blob {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_conversion() {
        assert_eq!(ValueType::from_u8(5), ValueType::U64);
        assert_eq!(ValueType::from_u8(0), ValueType::Unknown);
        assert_eq!(ValueType::from_u8(200), ValueType::Unknown);
    }

    #[test]
    fn test_accepts() {
        assert!(ValueType::Any.accepts(ValueType::U32));
        assert!(ValueType::U32.accepts(ValueType::U32));
        assert!(!ValueType::U64.accepts(ValueType::U32));
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let bytes = Value::U32(7).encode();
        assert!(Value::decode(ValueType::U64, &bytes).is_err());
        assert_eq!(Value::decode(ValueType::U32, &bytes).unwrap(), Value::U32(7));
    }

    #[test]
    fn test_decode_sentinel_fails() {
        assert!(Value::decode(ValueType::Unknown, b"").is_err());
        assert!(Value::decode(ValueType::Any, b"x").is_err());
    }

    #[test]
    fn test_json_shape() {
        let value = Value::Blob(vec![0xde, 0xad]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"type":"blob","value":"dead"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);

        let urn = Value::Urn(Urn::new("aff4://x"));
        assert_eq!(
            serde_json::to_string(&urn).unwrap(),
            r#"{"type":"urn","value":"aff4://x"}"#
        );
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::U16(3).as_u64(), Some(3));
        assert_eq!(Value::from("x").as_u64(), None);
        assert_eq!(Value::from(Urn::new("aff4://a")).as_str(), Some("aff4://a"));
    }
}
