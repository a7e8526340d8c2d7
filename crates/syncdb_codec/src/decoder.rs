//! Value decoder.

use crate::encoder::{
    TAG_BYTES, TAG_FALSE, TAG_FLOAT, TAG_INTEGER, TAG_LIST, TAG_NULL, TAG_SET, TAG_TEXT, TAG_TRUE,
};
use crate::error::{CodecError, CodecResult};
use crate::payload::PayloadReader;
use crate::value::Value;
use std::collections::BTreeSet;

/// Maximum allowed element count for lists and sets.
/// Guards allocation against untrusted input.
pub const MAX_CONTAINER_ELEMENTS: u64 = 1024 * 1024;

/// Maximum container nesting accepted by the decoder.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Decode exactly one value from `bytes`.
///
/// # Errors
///
/// Returns an error if the bytes are malformed, non-canonical, or if any
/// bytes remain after the value.
pub fn from_bytes(bytes: &[u8]) -> CodecResult<Value> {
    let mut reader = PayloadReader::new(bytes);
    let value = decode_value(&mut reader)?;
    reader.expect_end()?;
    Ok(value)
}

/// Decode one value starting at `cursor`, returning it with the new cursor.
///
/// # Errors
///
/// Returns an error if the value at `cursor` is malformed or truncated.
pub fn decode_at(bytes: &[u8], cursor: usize) -> CodecResult<(Value, usize)> {
    let mut reader = PayloadReader::at(bytes, cursor)?;
    let value = decode_value(&mut reader)?;
    Ok((value, reader.position()))
}

/// Decode the next value from `reader`.
pub fn decode_value(reader: &mut PayloadReader<'_>) -> CodecResult<Value> {
    decode_nested(reader, 0)
}

fn decode_nested(reader: &mut PayloadReader<'_>, depth: usize) -> CodecResult<Value> {
    let tag = reader.read_u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INTEGER => reader.read_signed_varint().map(Value::Integer),
        TAG_FLOAT => reader.read_f64().map(Value::Float),
        TAG_TEXT => reader.read_string().map(|s| Value::Text(s.to_string())),
        TAG_BYTES => reader.read_bytes().map(|b| Value::Bytes(b.to_vec())),
        TAG_LIST => {
            let len = container_len(reader, depth)?;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(decode_nested(reader, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        TAG_SET => {
            let len = container_len(reader, depth)?;
            let mut items = BTreeSet::new();
            let mut prev: Option<Value> = None;
            for _ in 0..len {
                let item = decode_nested(reader, depth + 1)?;
                // Elements must be strictly increasing
                if let Some(ref p) = prev {
                    if p >= &item {
                        return Err(CodecError::non_canonical(
                            "set elements not in strictly ascending order",
                        ));
                    }
                }
                prev = Some(item.clone());
                items.insert(item);
            }
            Ok(Value::Set(items))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn container_len(reader: &mut PayloadReader<'_>, depth: usize) -> CodecResult<usize> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(CodecError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
        });
    }
    reader.read_length(MAX_CONTAINER_ELEMENTS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::to_bytes;

    #[test]
    fn decode_scalars() {
        assert_eq!(from_bytes(&[0x00]).unwrap(), Value::Null);
        assert_eq!(from_bytes(&[0x01]).unwrap(), Value::Bool(false));
        assert_eq!(from_bytes(&[0x02]).unwrap(), Value::Bool(true));
        assert_eq!(from_bytes(&[0x03, 0x01]).unwrap(), Value::Integer(-1));
        assert_eq!(from_bytes(&[0x03, 0x80, 0x01]).unwrap(), Value::Integer(64));
    }

    #[test]
    fn decode_strings() {
        assert_eq!(
            from_bytes(&[0x05, 0x02, b'h', b'i']).unwrap(),
            Value::from("hi")
        );
        assert_eq!(
            from_bytes(&[0x06, 0x02, 9, 8]).unwrap(),
            Value::Bytes(vec![9, 8])
        );
    }

    #[test]
    fn decode_at_advances_cursor() {
        let mut bytes = to_bytes(&Value::Integer(300));
        bytes.extend(to_bytes(&Value::from("next")));

        let (first, cursor) = decode_at(&bytes, 0).unwrap();
        assert_eq!(first, Value::Integer(300));
        let (second, end) = decode_at(&bytes, cursor).unwrap();
        assert_eq!(second, Value::from("next"));
        assert_eq!(end, bytes.len());
    }

    #[test]
    fn reject_unknown_tag() {
        assert_eq!(from_bytes(&[0x09]), Err(CodecError::UnknownTag(0x09)));
        assert_eq!(from_bytes(&[0xff]), Err(CodecError::UnknownTag(0xff)));
    }

    #[test]
    fn reject_unsorted_set() {
        // Set with "b" before "a"
        let bytes = [0x08, 0x02, 0x05, 0x01, b'b', 0x05, 0x01, b'a'];
        assert!(matches!(
            from_bytes(&bytes),
            Err(CodecError::NonCanonical { .. })
        ));
    }

    #[test]
    fn reject_duplicate_set_elements() {
        let bytes = [0x08, 0x02, 0x03, 0x02, 0x03, 0x02];
        assert!(matches!(
            from_bytes(&bytes),
            Err(CodecError::NonCanonical { .. })
        ));
    }

    #[test]
    fn reject_trailing_bytes() {
        assert_eq!(
            from_bytes(&[0x00, 0x00]),
            Err(CodecError::TrailingBytes { count: 1 })
        );
    }

    #[test]
    fn truncated_input() {
        assert!(from_bytes(&[]).unwrap_err().is_truncation());
        assert!(from_bytes(&[0x04, 0x00, 0x00]).unwrap_err().is_truncation());
        // List claims two elements, has one
        assert!(from_bytes(&[0x07, 0x02, 0x00]).unwrap_err().is_truncation());
    }

    #[test]
    fn reject_oversized_container() {
        let mut bytes = vec![TAG_LIST];
        let mut writer = crate::payload::PayloadWriter::new();
        writer.write_varint(MAX_CONTAINER_ELEMENTS + 1);
        bytes.extend_from_slice(writer.as_bytes());
        assert!(matches!(
            from_bytes(&bytes),
            Err(CodecError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn reject_deep_nesting() {
        let mut bytes = vec![];
        for _ in 0..=MAX_NESTING_DEPTH {
            bytes.extend_from_slice(&[TAG_LIST, 0x01]);
        }
        bytes.push(TAG_NULL);
        assert_eq!(
            from_bytes(&bytes),
            Err(CodecError::NestingTooDeep {
                max: MAX_NESTING_DEPTH
            })
        );
    }
}
