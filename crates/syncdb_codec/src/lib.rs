//! # SyncDB Codec
//!
//! Tagged binary encoding for SyncDB values.
//!
//! Every encoded value starts with a one-byte type tag, so a stream of
//! heterogeneous values decodes without an external schema. The encoding is
//! deterministic:
//! - Identical values produce identical bytes
//! - Integers use zig-zag varints, so small magnitudes stay short
//! - Strings and byte strings are varint length-prefixed
//! - Set elements are written in canonical order
//!
//! The [`PayloadReader`] / [`PayloadWriter`] cursors used here are shared with
//! the sync protocol framing.
//!
//! ## Usage
//!
//! ```
//! use syncdb_codec::{from_bytes, to_bytes, Value};
//!
//! let value = Value::set(["sword", "shield"]);
//! let bytes = to_bytes(&value);
//!
//! let decoded = from_bytes(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod payload;
mod value;

pub use decoder::{decode_at, decode_value, from_bytes, MAX_CONTAINER_ELEMENTS, MAX_NESTING_DEPTH};
pub use encoder::{
    encode_value, encoded_len, to_bytes, TAG_BYTES, TAG_FALSE, TAG_FLOAT, TAG_INTEGER, TAG_LIST,
    TAG_NULL, TAG_SET, TAG_TEXT, TAG_TRUE,
};
pub use error::{CodecError, CodecResult};
pub use payload::{PayloadReader, PayloadWriter, MAX_BYTES_LENGTH, MAX_VARINT_LEN};
pub use value::{Value, ValueKind};

/// Trait for types that encode themselves to bytes.
pub trait Encode {
    /// Encode this value.
    fn encode(&self) -> Vec<u8>;
}

/// Trait for types that decode themselves from bytes.
pub trait Decode: Sized {
    /// Decode this value from bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> Vec<u8> {
        to_bytes(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(value: &Value) -> Value {
        from_bytes(&to_bytes(value)).unwrap()
    }

    #[test]
    fn roundtrip_nested() {
        let value = Value::List(vec![
            Value::set([Value::list(["a", "b"]), Value::list(["c"])]),
            Value::Float(-0.0),
            Value::Bytes(vec![]),
            Value::Null,
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn trait_roundtrip() {
        let value = Value::Integer(i64::MAX);
        assert_eq!(Value::decode(&value.encode()).unwrap(), value);
    }

    fn scalar_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            any::<f64>().prop_map(Value::Float),
            ".{0,16}".prop_map(Value::Text),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        ]
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        scalar_strategy().prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
                prop::collection::btree_set(inner, 0..8).prop_map(Value::Set),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(value in value_strategy()) {
            prop_assert_eq!(roundtrip(&value), value);
        }

        #[test]
        fn encoding_is_deterministic(value in value_strategy()) {
            prop_assert_eq!(to_bytes(&value), to_bytes(&value.clone()));
            prop_assert_eq!(encoded_len(&value), to_bytes(&value).len());
        }

        #[test]
        fn truncation_never_panics(value in value_strategy(), cut in 0usize..64) {
            let bytes = to_bytes(&value);
            let end = cut.min(bytes.len().saturating_sub(1));
            if end < bytes.len() {
                prop_assert!(from_bytes(&bytes[..end]).is_err());
            }
        }
    }
}
