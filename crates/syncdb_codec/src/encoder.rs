//! Deterministic value encoder.

use crate::payload::PayloadWriter;
use crate::value::Value;

/// Type tag for [`Value::Null`].
pub const TAG_NULL: u8 = 0x00;
/// Type tag for `Value::Bool(false)`.
pub const TAG_FALSE: u8 = 0x01;
/// Type tag for `Value::Bool(true)`.
pub const TAG_TRUE: u8 = 0x02;
/// Type tag for [`Value::Integer`].
pub const TAG_INTEGER: u8 = 0x03;
/// Type tag for [`Value::Float`].
pub const TAG_FLOAT: u8 = 0x04;
/// Type tag for [`Value::Text`].
pub const TAG_TEXT: u8 = 0x05;
/// Type tag for [`Value::Bytes`].
pub const TAG_BYTES: u8 = 0x06;
/// Type tag for [`Value::List`].
pub const TAG_LIST: u8 = 0x07;
/// Type tag for [`Value::Set`].
pub const TAG_SET: u8 = 0x08;

/// Encode a value to bytes.
///
/// The output is deterministic: equal values always produce identical bytes,
/// so encoded forms can be compared directly.
pub fn to_bytes(value: &Value) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    encode_value(&mut writer, value);
    writer.into_vec()
}

/// Append the tagged encoding of `value` to `writer`.
pub fn encode_value(writer: &mut PayloadWriter, value: &Value) {
    match value {
        Value::Null => writer.write_u8(TAG_NULL),
        Value::Bool(false) => writer.write_u8(TAG_FALSE),
        Value::Bool(true) => writer.write_u8(TAG_TRUE),
        Value::Integer(n) => {
            writer.write_u8(TAG_INTEGER);
            writer.write_signed_varint(*n);
        }
        Value::Float(n) => {
            writer.write_u8(TAG_FLOAT);
            writer.write_f64(*n);
        }
        Value::Text(s) => {
            writer.write_u8(TAG_TEXT);
            writer.write_string(s);
        }
        Value::Bytes(b) => {
            writer.write_u8(TAG_BYTES);
            writer.write_bytes(b);
        }
        Value::List(items) => {
            writer.write_u8(TAG_LIST);
            writer.write_varint(items.len() as u64);
            for item in items {
                encode_value(writer, item);
            }
        }
        Value::Set(items) => {
            // BTreeSet iteration is already in canonical order
            writer.write_u8(TAG_SET);
            writer.write_varint(items.len() as u64);
            for item in items {
                encode_value(writer, item);
            }
        }
    }
}

/// Returns the number of bytes `value` occupies when encoded.
pub fn encoded_len(value: &Value) -> usize {
    fn varint_len(mut n: u64) -> usize {
        let mut len = 1;
        while n >= 0x80 {
            n >>= 7;
            len += 1;
        }
        len
    }

    #[allow(clippy::cast_sign_loss)]
    let zigzag = |n: i64| ((n << 1) ^ (n >> 63)) as u64;

    1 + match value {
        Value::Null | Value::Bool(_) => 0,
        Value::Integer(n) => varint_len(zigzag(*n)),
        Value::Float(_) => 8,
        Value::Text(s) => varint_len(s.len() as u64) + s.len(),
        Value::Bytes(b) => varint_len(b.len() as u64) + b.len(),
        Value::List(items) => {
            varint_len(items.len() as u64) + items.iter().map(encoded_len).sum::<usize>()
        }
        Value::Set(items) => {
            varint_len(items.len() as u64) + items.iter().map(encoded_len).sum::<usize>()
        }
    }
}
