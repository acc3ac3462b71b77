//! Field values and their order-preserving key encoding.

use crate::error::{CupboardError, CupboardResult};
use serde::{Deserialize, Serialize};

// Type prefixes for the key encoding. The prefix determines cross-type
// ordering, so it must match the variant order of `Value`.
const TYPE_NULL: u8 = 0x01;
const TYPE_BOOL: u8 = 0x02;
const TYPE_INT: u8 = 0x03;
const TYPE_TEXT: u8 = 0x04;
const TYPE_BYTES: u8 = 0x05;

/// A record field value.
///
/// Floats are intentionally excluded so that every value has a canonical,
/// totally ordered byte encoding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Int(i64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
}

impl Value {
    /// Encodes the value to bytes whose lexicographic order matches value
    /// order: `a < b` if and only if `a.encode_key() < b.encode_key()`.
    ///
    /// Integers flip the sign bit and use big-endian so negatives sort
    /// before positives; strings get a NUL terminator so prefixes sort
    /// first; raw bytes escape embedded NULs.
    #[must_use]
    pub fn encode_key(&self) -> Vec<u8> {
        match self {
            Value::Null => vec![TYPE_NULL],
            Value::Bool(b) => vec![TYPE_BOOL, u8::from(*b)],
            Value::Int(i) => {
                let flipped = (*i as u64) ^ (1u64 << 63);
                let mut buf = vec![TYPE_INT];
                buf.extend_from_slice(&flipped.to_be_bytes());
                buf
            }
            Value::Text(s) => {
                let mut buf = vec![TYPE_TEXT];
                buf.extend_from_slice(s.as_bytes());
                buf.push(0x00);
                buf
            }
            Value::Bytes(bytes) => {
                let mut buf = vec![TYPE_BYTES];
                for &byte in bytes {
                    if byte == 0x00 {
                        buf.extend_from_slice(&[0x00, 0xFF]);
                    } else {
                        buf.push(byte);
                    }
                }
                buf.extend_from_slice(&[0x00, 0x00]);
                buf
            }
        }
    }

    /// Decodes a value from its key encoding.
    pub fn decode_key(bytes: &[u8]) -> CupboardResult<Self> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| CupboardError::codec("empty key encoding"))?;
        match tag {
            TYPE_NULL => {
                if rest.is_empty() {
                    Ok(Value::Null)
                } else {
                    Err(CupboardError::codec("trailing bytes after null key"))
                }
            }
            TYPE_BOOL => match rest {
                [0x00] => Ok(Value::Bool(false)),
                [0x01] => Ok(Value::Bool(true)),
                _ => Err(CupboardError::codec("invalid boolean key")),
            },
            TYPE_INT => {
                let arr: [u8; 8] = rest
                    .try_into()
                    .map_err(|_| CupboardError::codec("integer key must be 9 bytes"))?;
                let flipped = u64::from_be_bytes(arr);
                Ok(Value::Int((flipped ^ (1u64 << 63)) as i64))
            }
            TYPE_TEXT => {
                let body = rest
                    .strip_suffix(&[0x00])
                    .ok_or_else(|| CupboardError::codec("unterminated text key"))?;
                let s = std::str::from_utf8(body)
                    .map_err(|_| CupboardError::codec("invalid UTF-8 in text key"))?;
                Ok(Value::Text(s.to_string()))
            }
            TYPE_BYTES => {
                let body = rest
                    .strip_suffix(&[0x00, 0x00])
                    .ok_or_else(|| CupboardError::codec("unterminated bytes key"))?;
                let mut out = Vec::with_capacity(body.len());
                let mut iter = body.iter();
                while let Some(&byte) = iter.next() {
                    if byte == 0x00 {
                        match iter.next() {
                            Some(0xFF) => out.push(0x00),
                            _ => {
                                return Err(CupboardError::codec(
                                    "invalid escape in bytes key",
                                ))
                            }
                        }
                    } else {
                        out.push(byte);
                    }
                }
                Ok(Value::Bytes(out))
            }
            _ => Err(CupboardError::codec(format!("unknown key type {tag:#04x}"))),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = value.encode_key();
        assert_eq!(Value::decode_key(&encoded).unwrap(), value);
    }

    #[test]
    fn key_roundtrips() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(false));
        roundtrip(Value::Bool(true));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Text(String::new()));
        roundtrip(Value::Text("hello".into()));
        roundtrip(Value::Bytes(vec![]));
        roundtrip(Value::Bytes(vec![0, 1, 0, 255]));
    }

    #[test]
    fn integer_encoding_preserves_order() {
        let values = [i64::MIN, -1000, -1, 0, 1, 42, i64::MAX];
        for window in values.windows(2) {
            let a = Value::Int(window[0]).encode_key();
            let b = Value::Int(window[1]).encode_key();
            assert!(a < b, "{} should sort before {}", window[0], window[1]);
        }
    }

    #[test]
    fn text_encoding_preserves_order() {
        let a = Value::Text("a".into()).encode_key();
        let ab = Value::Text("ab".into()).encode_key();
        let b = Value::Text("b".into()).encode_key();
        assert!(a < ab);
        assert!(ab < b);
    }

    #[test]
    fn bytes_with_nul_preserve_order() {
        let a = Value::Bytes(vec![0]).encode_key();
        let b = Value::Bytes(vec![0, 1]).encode_key();
        let c = Value::Bytes(vec![1]).encode_key();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn cross_type_order_matches_value_order() {
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int(-5),
            Value::Text("x".into()),
            Value::Bytes(vec![1]),
        ];
        for window in values.windows(2) {
            assert!(window[0] < window[1]);
            assert!(window[0].encode_key() < window[1].encode_key());
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Value::decode_key(&[]).is_err());
        assert!(Value::decode_key(&[0x99]).is_err());
        assert!(Value::decode_key(&[TYPE_INT, 1, 2]).is_err());
    }
}
