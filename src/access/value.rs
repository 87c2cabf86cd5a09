//! Fixed-width field types.
//!
//! Every field serializes to a width determined solely by its type, so a
//! tuple's on-page size is a function of the schema alone.

use crate::storage::error::{DbError, DbResult};
use std::cmp::Ordering;

/// Maximum number of bytes stored for a text field.
pub const TEXT_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int32,
    Int64,
    Text,
}

impl DataType {
    /// On-page width of a field of this type.
    pub fn size(&self) -> usize {
        match self {
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Text => 2 + TEXT_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Int32(i32),
    Int64(i64),
    Text(String),
}

impl Field {
    pub fn data_type(&self) -> DataType {
        match self {
            Field::Int32(_) => DataType::Int32,
            Field::Int64(_) => DataType::Int64,
            Field::Text(_) => DataType::Text,
        }
    }

    /// Total order between two fields of the same type.
    ///
    /// Comparing fields of different types is a programming error: keys in
    /// one index are always of a single type.
    pub fn compare(&self, other: &Field) -> Ordering {
        match (self, other) {
            (Field::Int32(a), Field::Int32(b)) => a.cmp(b),
            (Field::Int64(a), Field::Int64(b)) => a.cmp(b),
            (Field::Text(a), Field::Text(b)) => a.cmp(b),
            (a, b) => panic!(
                "cannot compare fields of different types: {:?} vs {:?}",
                a.data_type(),
                b.data_type()
            ),
        }
    }

    /// Writes the field into `buf`, which must be exactly `data_type().size()`
    /// bytes. Text is stored as a 2-byte length followed by zero-padded bytes.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.data_type().size());
        match self {
            Field::Int32(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Field::Int64(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Field::Text(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(TEXT_LEN);
                buf[0..2].copy_from_slice(&(len as u16).to_le_bytes());
                buf[2..2 + len].copy_from_slice(&bytes[..len]);
                buf[2 + len..].fill(0);
            }
        }
    }

    pub fn deserialize(data_type: DataType, buf: &[u8]) -> DbResult<Field> {
        debug_assert_eq!(buf.len(), data_type.size());
        match data_type {
            DataType::Int32 => Ok(Field::Int32(i32::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3],
            ]))),
            DataType::Int64 => Ok(Field::Int64(i64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]))),
            DataType::Text => {
                let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
                if len > TEXT_LEN {
                    return Err(DbError::Corrupted(format!(
                        "text field length {} exceeds maximum {}",
                        len, TEXT_LEN
                    )));
                }
                let s = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|e| DbError::Corrupted(format!("invalid utf-8 in text field: {e}")))?;
                Ok(Field::Text(s.to_string()))
            }
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Int32(v) => write!(f, "{v}"),
            Field::Int64(v) => write!(f, "{v}"),
            Field::Text(s) => write!(f, "{s:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_sizes() {
        assert_eq!(DataType::Int32.size(), 4);
        assert_eq!(DataType::Int64.size(), 8);
        assert_eq!(DataType::Text.size(), 34);
    }

    #[test]
    fn test_int32_round_trip() {
        let field = Field::Int32(-42);
        let mut buf = vec![0u8; 4];
        field.serialize_into(&mut buf);
        assert_eq!(Field::deserialize(DataType::Int32, &buf).unwrap(), field);
    }

    #[test]
    fn test_int64_round_trip() {
        let field = Field::Int64(i64::MIN);
        let mut buf = vec![0u8; 8];
        field.serialize_into(&mut buf);
        assert_eq!(Field::deserialize(DataType::Int64, &buf).unwrap(), field);
    }

    #[test]
    fn test_text_round_trip() {
        let field = Field::Text("hello".to_string());
        let mut buf = vec![0u8; DataType::Text.size()];
        field.serialize_into(&mut buf);
        assert_eq!(Field::deserialize(DataType::Text, &buf).unwrap(), field);
    }

    #[test]
    fn test_text_truncated_to_max_len() {
        let long = "x".repeat(TEXT_LEN + 10);
        let field = Field::Text(long);
        let mut buf = vec![0u8; DataType::Text.size()];
        field.serialize_into(&mut buf);
        let decoded = Field::deserialize(DataType::Text, &buf).unwrap();
        assert_eq!(decoded, Field::Text("x".repeat(TEXT_LEN)));
    }

    #[test]
    fn test_ordering() {
        assert_eq!(
            Field::Int32(1).compare(&Field::Int32(2)),
            Ordering::Less
        );
        assert_eq!(
            Field::Text("b".into()).compare(&Field::Text("a".into())),
            Ordering::Greater
        );
    }

    #[test]
    #[should_panic]
    fn test_cross_type_comparison_panics() {
        Field::Int32(1).compare(&Field::Int64(1));
    }

    #[test]
    fn test_corrupted_text_length() {
        let mut buf = vec![0u8; DataType::Text.size()];
        buf[0..2].copy_from_slice(&(TEXT_LEN as u16 + 1).to_le_bytes());
        assert!(Field::deserialize(DataType::Text, &buf).is_err());
    }
}
