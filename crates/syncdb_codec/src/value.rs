//! Dynamic value type stored in a SyncDB.

use crate::error::CodecError;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// A dynamic, self-describing value.
///
/// Every value has a total canonical order (see [`Value::cmp_canonical`]),
/// so values can live in ordered sets and two values compare equal exactly
/// when their encodings are identical.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value. Used as the tombstone for removed keys.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Double-precision float.
    Float(f64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Set of values, kept in canonical order.
    Set(BTreeSet<Value>),
}

/// The kind of a [`Value`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    /// [`Value::Null`].
    Null,
    /// [`Value::Bool`].
    Bool,
    /// [`Value::Integer`].
    Integer,
    /// [`Value::Float`].
    Float,
    /// [`Value::Text`].
    Text,
    /// [`Value::Bytes`].
    Bytes,
    /// [`Value::List`].
    List,
    /// [`Value::Set`].
    Set,
}

impl ValueKind {
    /// Short lowercase name of the kind.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
            ValueKind::Set => "set",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    /// Create a list value.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Create a set value. Duplicates collapse.
    pub fn set<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Set(items.into_iter().map(Into::into).collect())
    }

    /// Create an empty set value.
    pub fn empty_set() -> Self {
        Value::Set(BTreeSet::new())
    }

    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
        }
    }

    /// Compare two values for canonical ordering.
    ///
    /// Values of different kinds order by kind. Within a kind, text, bytes,
    /// lists and sets order length-first and then element by element; floats
    /// use the IEEE 754 total order.
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        let self_kind = self.kind();
        let other_kind = other.kind();

        if self_kind != other_kind {
            return self_kind.cmp(&other_kind);
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => a.cmp(b),
                ord => ord,
            },
            (Value::Bytes(a), Value::Bytes(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => a.cmp(b),
                ord => ord,
            },
            (Value::List(a), Value::List(b)) => Self::cmp_sequences(a.iter(), b.iter(), a.len(), b.len()),
            (Value::Set(a), Value::Set(b)) => Self::cmp_sequences(a.iter(), b.iter(), a.len(), b.len()),
            _ => Ordering::Equal, // Unreachable with equal kinds
        }
    }

    fn cmp_sequences<'a>(
        a: impl Iterator<Item = &'a Value>,
        b: impl Iterator<Item = &'a Value>,
        a_len: usize,
        b_len: usize,
    ) -> Ordering {
        match a_len.cmp(&b_len) {
            Ordering::Equal => {
                for (av, bv) in a.zip(b) {
                    let ord = av.cmp_canonical(bv);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
            ord => ord,
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float, if it is one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get this value as a set, if it is one.
    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Nesting depth of this value. Scalars have depth 0.
    pub fn depth(&self) -> usize {
        match self {
            Value::List(items) => 1 + items.iter().map(Value::depth).max().unwrap_or(0),
            Value::Set(items) => 1 + items.iter().map(Value::depth).max().unwrap_or(0),
            _ => 0,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_canonical(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_canonical(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n:?}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Set(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Float(f64::from(n))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<BTreeSet<Value>> for Value {
    fn from(set: BTreeSet<Value>) -> Self {
        Value::Set(set)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

fn mismatch(expected: &'static str, found: &Value) -> CodecError {
    CodecError::TypeMismatch {
        expected,
        found: found.kind().name(),
    }
}

impl TryFrom<Value> for bool {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| mismatch("bool", &value))
    }
}

impl TryFrom<Value> for i64 {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_integer().ok_or_else(|| mismatch("integer", &value))
    }
}

impl TryFrom<Value> for f64 {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_float().ok_or_else(|| mismatch("float", &value))
    }
}

impl TryFrom<Value> for String {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl TryFrom<Value> for BTreeSet<Value> {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Set(s) => Ok(s),
            other => Err(mismatch("set", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_elements_are_sorted_and_deduplicated() {
        let set = Value::set(["m", "a", "z", "a"]);
        let items: Vec<_> = set.as_set().unwrap().iter().cloned().collect();
        assert_eq!(
            items,
            vec![Value::from("a"), Value::from("m"), Value::from("z")]
        );
    }

    #[test]
    fn text_length_ordering() {
        // Shorter strings come first
        let mut values = vec![Value::from("abc"), Value::from("b"), Value::from("ab")];
        values.sort();
        assert_eq!(
            values,
            vec![Value::from("b"), Value::from("ab"), Value::from("abc")]
        );
    }

    #[test]
    fn kinds_order_before_content() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::Bool(true) < Value::Integer(i64::MIN));
        assert!(Value::Integer(i64::MAX) < Value::Float(f64::NEG_INFINITY));
        assert!(Value::Float(1.0) < Value::Text(String::new()));
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Float(1.0), Value::Integer(1));
    }

    #[test]
    fn value_accessors() {
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(true).is_null());

        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_bool(), None);
        assert_eq!(Value::Integer(42).as_integer(), Some(42));
        assert_eq!(Value::Float(1.5).as_float(), Some(1.5));
        assert_eq!(Value::from("hello").as_text(), Some("hello"));
        assert_eq!(Value::Bytes(vec![1, 2, 3]).as_bytes(), Some(&[1, 2, 3][..]));
        assert_eq!(Value::list([1i64, 2]).as_list().map(<[Value]>::len), Some(2));
    }

    #[test]
    fn depth_counts_containers() {
        assert_eq!(Value::Integer(1).depth(), 0);
        assert_eq!(Value::list([1i64]).depth(), 1);
        let nested = Value::List(vec![Value::set([1i64]), Value::Null]);
        assert_eq!(nested.depth(), 2);
    }

    #[test]
    fn display_rendering() {
        let value = Value::List(vec![
            Value::from("a"),
            Value::Bytes(vec![0xde, 0xad]),
            Value::set([2i64, 1]),
            Value::Null,
        ]);
        assert_eq!(value.to_string(), r#"["a", 0xdead, {1, 2}, null]"#);
    }

    #[test]
    fn try_from_native() {
        assert_eq!(i64::try_from(Value::Integer(7)), Ok(7));
        assert_eq!(
            bool::try_from(Value::Integer(7)),
            Err(CodecError::TypeMismatch {
                expected: "bool",
                found: "integer"
            })
        );
        assert_eq!(String::try_from(Value::from("x")), Ok("x".to_string()));
    }
}
