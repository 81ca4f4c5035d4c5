//! Encoding utilities for the persisted index format.
//!
//! Everything is fixed width and little-endian:
//! - `u8` flags and key bytes
//! - `u32` tags and counts
//! - `u64` document ids

use std::io::{self, Write};

use crate::error::{PersistenceError, PersistenceResult};

/// Write a single byte.
pub fn write_u8<W: Write>(out: &mut W, value: u8) -> io::Result<()> {
    out.write_all(&[value])
}

/// Write a little-endian `u32`.
pub fn write_u32<W: Write>(out: &mut W, value: u32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

/// Write a little-endian `u64`.
pub fn write_u64<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

/// Cursor over an encoded buffer that reports the offset of short reads.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the whole buffer has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> PersistenceResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(PersistenceError::Truncated {
                offset: self.pos,
                needed: len,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> PersistenceResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> PersistenceResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self) -> PersistenceResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&mut self) -> PersistenceResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x0102_0304).unwrap();
        write_u8(&mut buf, 1).unwrap();
        write_u64(&mut buf, 7).unwrap();
        assert_eq!(&buf[..5], &[4, 3, 2, 1, 1]);
        assert_eq!(&buf[5..], &[7, 0, 0, 0, 0, 0, 0, 0]);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u64().unwrap(), 7);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_short_read_reports_offset() {
        let mut reader = ByteReader::new(&[1, 0, 0, 0, 9]);
        reader.read_u32().unwrap();
        match reader.read_u32() {
            Err(PersistenceError::Truncated { offset, needed }) => {
                assert_eq!(offset, 4);
                assert_eq!(needed, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        // A failed read consumes nothing.
        assert_eq!(reader.read_u8().unwrap(), 9);
    }
}
