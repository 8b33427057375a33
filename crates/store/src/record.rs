//! Record codec.
//!
//! A record is an ordered sequence of typed values. Encoding:
//!
//! ```text
//! [ field count: varint ]
//! [ header: per field [ tag: u8 ][ payload length: varint ] ]
//! [ payloads, in field order ]
//!
//!   tag  type     payload
//!   0    Null     empty
//!   1    Integer  zigzag varint (1..=10 bytes)
//!   2    Float    8 bytes, little-endian IEEE 754
//!   3    Text     UTF-8 bytes
//!   4    Blob     bytes
//! ```
//!
//! The header alone locates every field. Tags are stable on disk. Decoding
//! a tag outside this table fails with [`Error::UnsupportedType`].

use crate::error::{Error, Result};

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// A single typed value.
///
/// Equality compares floats by their bits, so a decoded value always equals
/// the one that was encoded: NaN equals the same NaN, and `0.0` differs
/// from `-0.0`.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value.
    Null,
    /// Signed 64-bit integer.
    Integer(i64),
    /// 64-bit float. Stored bit-exactly, NaN payloads included.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// The on-disk type tag.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Integer(_) => TAG_INTEGER,
            Value::Float(_) => TAG_FLOAT,
            Value::Text(_) => TAG_TEXT,
            Value::Blob(_) => TAG_BLOB,
        }
    }

    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the integer, if this is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float, if this is one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a blob.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }

    /// Appends the payload, returning its length.
    fn write_payload(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        match self {
            Value::Null => {},
            Value::Integer(v) => write_varint(buf, zigzag(*v)),
            Value::Float(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Text(v) => buf.extend_from_slice(v.as_bytes()),
            Value::Blob(v) => buf.extend_from_slice(v),
        }
        buf.len() - start
    }

    fn decode_payload(tag: u8, payload: &[u8]) -> Result<Self> {
        Ok(match tag {
            TAG_NULL if payload.is_empty() => Value::Null,
            TAG_NULL => return Err(Error::corrupted("record null carries a payload")),
            TAG_INTEGER => {
                let (raw, used) = read_varint(payload)?;
                if used != payload.len() {
                    return Err(Error::corrupted("record integer does not fill its field"));
                }
                Value::Integer(unzigzag(raw))
            },
            TAG_FLOAT => {
                let bits: [u8; 8] =
                    payload.try_into().map_err(|_| Error::corrupted("record float is not 8 bytes"))?;
                Value::Float(f64::from_bits(u64::from_le_bytes(bits)))
            },
            TAG_TEXT => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| Error::corrupted(format!("record text is not UTF-8: {e}")))?;
                Value::Text(text.to_string())
            },
            TAG_BLOB => Value::Blob(payload.to_vec()),
            tag => return Err(Error::UnsupportedType { tag }),
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// An ordered sequence of values stored under one key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record(pub Vec<Value>);

impl Record {
    /// Creates a record from its values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// The values in field order.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Consumes the record, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Field at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut payloads = Vec::with_capacity(self.encoded_size_hint());
        let mut buf = Vec::with_capacity(payloads.capacity() + 2 * self.0.len() + 10);
        write_varint(&mut buf, self.0.len() as u64);
        for value in &self.0 {
            let len = value.write_payload(&mut payloads);
            buf.push(value.tag());
            write_varint(&mut buf, len as u64);
        }
        buf.extend_from_slice(&payloads);
        buf
    }

    fn encoded_size_hint(&self) -> usize {
        self.0
            .iter()
            .map(|v| match v {
                Value::Text(t) => t.len() + 10,
                Value::Blob(b) => b.len() + 10,
                _ => 10,
            })
            .sum::<usize>()
            + 10
    }

    /// Deserializes a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedType`] for an unknown type tag and
    /// [`Error::Corrupted`] for truncated input, payload lengths that do not
    /// match the header, invalid UTF-8, overlong varints or trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { buf: bytes, pos: 0 };
        let count = reader.varint()?;
        // Every field takes at least two header bytes.
        if count > bytes.len() as u64 / 2 {
            return Err(Error::corrupted(format!(
                "record claims {count} fields in {} bytes",
                bytes.len()
            )));
        }

        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = reader.byte()?;
            if tag > TAG_BLOB {
                return Err(Error::UnsupportedType { tag });
            }
            fields.push((tag, reader.length()?));
        }

        let mut values = Vec::with_capacity(fields.len());
        for (tag, len) in fields {
            values.push(Value::decode_payload(tag, reader.take(len)?)?);
        }

        if reader.pos != bytes.len() {
            return Err(Error::corrupted(format!(
                "{} trailing bytes after record",
                bytes.len() - reader.pos
            )));
        }
        Ok(Self(values))
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Record {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::corrupted("record truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, used) = read_varint(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    fn length(&mut self) -> Result<usize> {
        usize::try_from(self.varint()?).map_err(|_| Error::corrupted("record length overflows"))
    }
}

/// Appends `value` as an LEB128 varint.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Reads an LEB128 varint, returning the value and the bytes consumed.
pub(crate) fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        let bits = u64::from(byte & 0x7F);
        if i == 9 && bits > 1 {
            return Err(Error::corrupted("varint overflows 64 bits"));
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::corrupted("varint truncated or longer than 10 bytes"))
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_value() -> impl Strategy<Value = super::Value> {
        prop_oneof![
            Just(super::Value::Null),
            any::<i64>().prop_map(super::Value::Integer),
            any::<f64>().prop_map(super::Value::Float),
            ".{0,40}".prop_map(super::Value::Text),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(super::Value::Blob),
        ]
    }

    #[test]
    fn test_every_shape_round_trips() {
        let record = Record::new(vec![
            Value::Null,
            Value::Integer(0),
            Value::Integer(-1),
            Value::Integer(i64::MIN),
            Value::Integer(i64::MAX),
            Value::Float(-0.0),
            Value::Float(f64::INFINITY),
            Value::Text(String::new()),
            Value::Text("snowman ☃".into()),
            Value::Blob(Vec::new()),
            Value::Blob(vec![0, 255, 7]),
        ]);
        assert_eq!(Record::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn test_empty_record() {
        let record = Record::default();
        assert_eq!(record.encode(), vec![0]);
        assert_eq!(Record::decode(&[0]).unwrap(), record);
    }

    #[test]
    fn test_known_encoding() {
        let record = Record::new(vec![Value::Integer(-2), Value::Text("hi".into()), Value::Null]);
        assert_eq!(
            record.encode(),
            vec![3, TAG_INTEGER, 1, TAG_TEXT, 2, TAG_NULL, 0, 3, b'h', b'i']
        );
    }

    #[test]
    fn test_header_precedes_payloads() {
        let record = Record::new(vec![Value::Blob(vec![0xAB; 200]), Value::Float(1.0)]);
        let bytes = record.encode();
        // count, blob tag + two-byte length, float tag + length
        assert_eq!(&bytes[..6], &[2, TAG_BLOB, 0xC8, 0x01, TAG_FLOAT, 8]);
        assert_eq!(&bytes[6..206], &[0xAB; 200][..]);
        assert_eq!(&bytes[206..], &1.0f64.to_bits().to_le_bytes());
    }

    #[test]
    fn test_header_length_mismatch_is_corrupt() {
        // a float field declared as 4 bytes
        let bytes = [1, TAG_FLOAT, 4, 0, 0, 0, 0];
        assert!(matches!(Record::decode(&bytes), Err(Error::Corrupted { .. })));
        // an integer whose varint stops before the declared length
        let bytes = [1, TAG_INTEGER, 2, 3, 0];
        assert!(matches!(Record::decode(&bytes), Err(Error::Corrupted { .. })));
        // a null with a payload
        let bytes = [1, TAG_NULL, 1, 0];
        assert!(matches!(Record::decode(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_nan_bits_preserved() {
        let nan = f64::from_bits(0x7FF8_0000_0000_1234);
        let record = Record::new(vec![Value::Float(nan)]);
        let decoded = Record::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.get(0).and_then(Value::as_float).map(f64::to_bits), Some(nan.to_bits()));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Float(1.0), Value::Integer(1));
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        assert!(matches!(Record::decode(&[1, 9]), Err(Error::UnsupportedType { tag: 9 })));
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        let bytes = Record::new(vec![Value::Blob(vec![1; 20])]).encode();
        assert!(matches!(Record::decode(&bytes[..bytes.len() - 1]), Err(Error::Corrupted { .. })));
        assert!(matches!(Record::decode(&[]), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        assert!(matches!(Record::decode(&[0, 0]), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        assert!(matches!(Record::decode(&[1, TAG_TEXT, 1, 0xFF]), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_absurd_field_count_is_corrupt() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, u64::MAX);
        assert!(matches!(Record::decode(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(read_varint(&buf).unwrap(), (value, buf.len()));
        }
        assert!(read_varint(&[0x80; 11]).is_err());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(5i64), Value::Integer(5));
        assert_eq!(Value::from("x"), Value::Text("x".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(&b"ab"[..]).as_blob(), Some(&b"ab"[..]));
        let record: Record = vec![Value::from(1.5)].into_iter().collect();
        assert_eq!(record.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_record_round_trip(values in proptest::collection::vec(arb_value(), 0..12)) {
            let record = Record::new(values);
            prop_assert_eq!(Record::decode(&record.encode()).unwrap(), record);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Record::decode(&bytes);
        }
    }
}
