//! Variable-byte integer encoding shared by every postings flavor.
//!
//! Integers are written 7 bits per byte, least significant chunk first,
//! with the high bit of each byte set when more bytes follow. Floats are
//! written as their raw little-endian IEEE-754 bits so that vector-length
//! files can be decoded without any parsing.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{Result, TesseraError};

#[cfg(test)]
fn encode_u32(value: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(5);
    encode_u32_into(&mut bytes, value);
    bytes
}

/// Append the encoding of `value` to `buf`, returning the number of bytes written.
#[inline]
pub fn encode_u32_into(buf: &mut Vec<u8>, value: u32) -> usize {
    encode_u64_into(buf, value as u64)
}

/// Append the encoding of a u64 `value` to `buf`, returning the number of bytes written.
#[inline]
pub fn encode_u64_into(buf: &mut Vec<u8>, value: u64) -> usize {
    let mut val = value;
    let mut written = 0;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80;
        }

        buf.push(byte);
        written += 1;

        if val == 0 {
            return written;
        }
    }
}

/// Number of bytes `value` occupies once encoded.
#[inline]
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Decode a u32 value from variable-length encoding.
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize)> {
    let (value, read) = decode_u64(bytes)?;
    u32::try_from(value)
        .map(|v| (v, read))
        .map_err(|_| TesseraError::other("VarInt overflow"))
}

/// Decode a u64 value from variable-length encoding.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(TesseraError::other("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(TesseraError::truncated("Incomplete VarInt"))
}

/// Append the raw bits of an f32 to `buf`.
#[inline]
pub fn encode_f32_into(buf: &mut Vec<u8>, value: f32) -> usize {
    buf.extend_from_slice(&value.to_bits().to_le_bytes());
    4
}

/// Decode an f32 written by [`encode_f32_into`].
pub fn decode_f32(bytes: &[u8]) -> Result<f32> {
    let raw: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TesseraError::truncated("Incomplete float"))?;
    Ok(f32::from_bits(u32::from_le_bytes(raw)))
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let mut bytes = Vec::with_capacity(10);
    let n = encode_u64_into(&mut bytes, value);
    writer.write_all(&bytes)?;
    Ok(n)
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(TesseraError::other("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// A decoding cursor over an encoded buffer.
///
/// The `try_*` methods return `None` instead of an error when the buffer
/// ends mid-value; iterators use them so that exhausting a buffer and a
/// truncated buffer both simply end iteration. The `read_*` methods turn
/// the same condition into a truncation error for header parsing.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    /// Create a reader positioned at `pos`.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        ByteReader { data, pos }
    }

    /// Current read position.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the read position.
    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Whether every byte has been consumed.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Bytes left to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Decode a u32, or `None` at end of buffer.
    #[inline]
    pub fn try_u32(&mut self) -> Option<u32> {
        self.try_u64().and_then(|v| u32::try_from(v).ok())
    }

    /// Decode a u64, or `None` at end of buffer.
    #[inline]
    pub fn try_u64(&mut self) -> Option<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        let mut pos = self.pos;

        while pos < self.data.len() && shift < 64 {
            let byte = self.data[pos];
            pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                self.pos = pos;
                return Some(result);
            }
            shift += 7;
        }

        None
    }

    /// Decode a u32 or fail with a truncation error.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.try_u32()
            .ok_or_else(|| TesseraError::truncated(format!("VarInt at byte {}", self.pos)))
    }

    /// Decode a u64 or fail with a truncation error.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.try_u64()
            .ok_or_else(|| TesseraError::truncated(format!("VarInt at byte {}", self.pos)))
    }

    /// Decode a float written by [`encode_f32_into`].
    pub fn read_f32(&mut self) -> Result<f32> {
        let value = decode_f32(&self.data[self.pos.min(self.data.len())..])?;
        self.pos += 4;
        Ok(value)
    }

    /// Borrow the next `len` bytes.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| TesseraError::truncated(format!("{len} bytes at {}", self.pos)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Decode a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_slice(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TesseraError::storage(format!("Invalid UTF-8: {e}")))
    }
}

/// Append a length-prefixed UTF-8 string.
pub fn encode_string_into(buf: &mut Vec<u8>, value: &str) {
    encode_u32_into(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_u32() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u32::MAX];

        for &value in &test_values {
            let encoded = encode_u32(value);
            let (decoded, bytes_read) = decode_u32(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
            assert_eq!(encoded_len(value as u64), encoded.len());
        }
    }

    #[test]
    fn test_chunk_order_is_low_bits_first() {
        // 300 = 0b10_0101100 -> low 7 bits 0x2C with continuation, then 0x02.
        assert_eq!(encode_u32(300), vec![0xAC, 0x02]);
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u32(0).len(), 1);
        assert_eq!(encode_u32(127).len(), 1);
        assert_eq!(encode_u32(128).len(), 2);
        assert_eq!(encode_u32(16383).len(), 2);
        assert_eq!(encode_u32(16384).len(), 3);
        assert_eq!(encode_u32(u32::MAX).len(), 5);
        assert_eq!(encoded_len(u64::MAX), 10);
    }

    #[test]
    fn test_float_round_trip() {
        let mut buf = Vec::new();
        encode_f32_into(&mut buf, 2.5);
        encode_f32_into(&mut buf, -0.125);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_f32().unwrap(), 2.5);
        assert_eq!(reader.read_f32().unwrap(), -0.125);
        assert!(reader.is_exhausted());
        assert!(reader.read_f32().is_err());
    }

    #[test]
    fn test_byte_reader_sequence() {
        let mut buf = Vec::new();
        encode_u32_into(&mut buf, 5);
        encode_u64_into(&mut buf, 1 << 40);
        encode_string_into(&mut buf, "term");

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.try_u32(), Some(5));
        assert_eq!(reader.read_u64().unwrap(), 1 << 40);
        assert_eq!(reader.read_string().unwrap(), "term");
        assert_eq!(reader.try_u32(), None);
    }

    #[test]
    fn test_incomplete_varint() {
        let incomplete = vec![0x80];
        assert!(decode_u32(&incomplete).is_err());
        assert!(decode_u64(&incomplete).is_err());

        let mut reader = ByteReader::new(&incomplete);
        assert_eq!(reader.try_u32(), None);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_overflow() {
        let overflow_data = vec![0xFF; 10];
        assert!(decode_u32(&overflow_data).is_err());
    }

    #[test]
    fn test_write_read_u64() {
        let mut buffer = Vec::new();
        let value = 123456789012345u64;

        let bytes_written = write_u64(&mut buffer, value).unwrap();
        assert_eq!(bytes_written, buffer.len());

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_u64(&mut cursor).unwrap(), value);
    }
}
