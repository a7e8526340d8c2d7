//! Cursor-based payload primitives.
//!
//! [`PayloadWriter`] appends fixed-width integers, LEB128 varints and
//! length-prefixed byte strings to a growable buffer. [`PayloadReader`] reads
//! them back from a borrowed slice and fails with
//! [`CodecError::TruncatedPayload`] whenever a read runs past the end.

use crate::error::{CodecError, CodecResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Longest LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Maximum length accepted for a length-prefixed byte or text string.
pub const MAX_BYTES_LENGTH: u64 = 64 * 1024 * 1024;

/// Append-only payload buffer.
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buffer: BytesMut,
}

impl PayloadWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get a reference to the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the frozen buffer.
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Consume the writer and return the bytes as a vector.
    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    /// Write a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    /// Write an unsigned LEB128 varint.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buffer.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buffer.put_u8(value as u8);
    }

    /// Write a signed integer as a zig-zag varint.
    #[allow(clippy::cast_sign_loss)]
    pub fn write_signed_varint(&mut self, value: i64) {
        self.write_varint(((value << 1) ^ (value >> 63)) as u64);
    }

    /// Write a big-endian IEEE 754 double.
    pub fn write_f64(&mut self, value: f64) {
        self.buffer.put_u64(value.to_bits());
    }

    /// Write a varint length prefix followed by the bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.buffer.put_slice(bytes);
    }

    /// Write a varint length prefix followed by the UTF-8 bytes.
    pub fn write_string(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }

    /// Write raw bytes with no prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }
}

/// Bounded read cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Create a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Create a reader positioned at `cursor`.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedPayload` if the cursor lies beyond the buffer.
    pub fn at(data: &'a [u8], cursor: usize) -> CodecResult<Self> {
        if cursor > data.len() {
            return Err(CodecError::TruncatedPayload {
                needed: cursor,
                available: data.len(),
            });
        }
        Ok(Self { data, pos: cursor })
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Fail with `TrailingBytes` unless the buffer is fully consumed.
    pub fn expect_end(&self) -> CodecResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes {
                count: self.remaining(),
            })
        }
    }

    /// Read a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::TruncatedPayload {
            needed: 1,
            available: 0,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        let bytes = self.read_raw(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> CodecResult<u64> {
        let mut result = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let low = u64::from(byte & 0x7f);
            // The tenth byte may only carry the top bit of a u64.
            if i == MAX_VARINT_LEN - 1 && low > 1 {
                return Err(CodecError::VarIntOverflow);
            }
            result |= low << (7 * i);
            if byte & 0x80 == 0 {
                if i > 0 && byte == 0 {
                    return Err(CodecError::non_canonical("varint has trailing zero bytes"));
                }
                return Ok(result);
            }
        }
        Err(CodecError::VarIntOverflow)
    }

    /// Read a zig-zag encoded signed varint.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_signed_varint(&mut self) -> CodecResult<i64> {
        let raw = self.read_varint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    /// Read a big-endian IEEE 754 double.
    pub fn read_f64(&mut self) -> CodecResult<f64> {
        let bytes = self.read_raw(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_be_bytes(buf)))
    }

    /// Read a varint length and return it as `usize`, bounded by `max`.
    pub fn read_length(&mut self, max: u64) -> CodecResult<usize> {
        let len = self.read_varint()?;
        if len > max {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: max,
            });
        }
        usize::try_from(len).map_err(|_| CodecError::SizeLimitExceeded {
            claimed: len,
            max_allowed: max,
        })
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.read_length(MAX_BYTES_LENGTH)?;
        self.read_raw(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> CodecResult<&'a str> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read exactly `len` raw bytes.
    #[inline]
    pub fn read_raw(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let available = self.remaining();
        if len > available {
            return Err(CodecError::TruncatedPayload {
                needed: len,
                available,
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_encodings() {
        let cases: [(u64, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
        ];
        for (value, expected) in cases {
            let mut writer = PayloadWriter::new();
            writer.write_varint(value);
            assert_eq!(writer.as_bytes(), expected, "encoding {value}");

            let mut reader = PayloadReader::new(expected);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn varint_max_value() {
        let mut writer = PayloadWriter::new();
        writer.write_varint(u64::MAX);
        assert_eq!(writer.len(), MAX_VARINT_LEN);

        let bytes = writer.into_vec();
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_varint().unwrap(), u64::MAX);
    }

    #[test]
    fn varint_overflow_rejected() {
        let bytes = [0xff; 11];
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_varint(), Err(CodecError::VarIntOverflow));

        // Tenth byte carrying more than one bit
        let mut bytes = [0xffu8; 10];
        bytes[9] = 0x02;
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_varint(), Err(CodecError::VarIntOverflow));
    }

    #[test]
    fn varint_trailing_zero_rejected() {
        let mut reader = PayloadReader::new(&[0x80, 0x00]);
        assert!(matches!(
            reader.read_varint(),
            Err(CodecError::NonCanonical { .. })
        ));
    }

    #[test]
    fn zigzag_small_magnitudes_stay_short() {
        for (value, expected) in [(0i64, 0x00u8), (-1, 0x01), (1, 0x02), (-2, 0x03)] {
            let mut writer = PayloadWriter::new();
            writer.write_signed_varint(value);
            assert_eq!(writer.as_bytes(), &[expected]);
        }

        for value in [i64::MIN, i64::MAX, -1_000_000, 1_000_000] {
            let mut writer = PayloadWriter::new();
            writer.write_signed_varint(value);
            let bytes = writer.into_vec();
            let mut reader = PayloadReader::new(&bytes);
            assert_eq!(reader.read_signed_varint().unwrap(), value);
        }
    }

    #[test]
    fn fixed_width_fields() {
        let mut writer = PayloadWriter::new();
        writer.write_u8(7);
        writer.write_u32(0xdead_beef);
        writer.write_f64(-2.5);
        assert_eq!(&writer.as_bytes()[..5], &[7, 0xde, 0xad, 0xbe, 0xef]);

        let bytes = writer.into_vec();
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_f64().unwrap(), -2.5);
        assert!(reader.expect_end().is_ok());
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut writer = PayloadWriter::new();
        writer.write_string("héllo");
        assert_eq!(writer.as_bytes()[0], 6);

        let bytes = writer.into_vec();
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "héllo");
    }

    #[test]
    fn truncated_reads_fail() {
        let mut reader = PayloadReader::new(&[0x01, 0x02]);
        assert_eq!(
            reader.read_u32(),
            Err(CodecError::TruncatedPayload {
                needed: 4,
                available: 2
            })
        );

        let mut reader = PayloadReader::new(&[]);
        assert!(reader.read_u8().unwrap_err().is_truncation());

        // Length prefix claims more than is present
        let mut reader = PayloadReader::new(&[0x05, b'a', b'b']);
        assert!(reader.read_string().unwrap_err().is_truncation());

        // Unterminated varint
        let mut reader = PayloadReader::new(&[0x80, 0x80]);
        assert!(reader.read_varint().unwrap_err().is_truncation());
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut reader = PayloadReader::new(&[0x02, 0xff, 0xfe]);
        assert_eq!(reader.read_string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn trailing_bytes_detected() {
        let reader = PayloadReader::new(&[0x01]);
        assert_eq!(reader.expect_end(), Err(CodecError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn reader_at_cursor() {
        let data = [0x01, 0x02, 0x03];
        let mut reader = PayloadReader::at(&data, 2).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 0x03);
        assert!(PayloadReader::at(&data, 4).unwrap_err().is_truncation());
    }
}
