//! Little-endian wire codec primitives.
//!
//! The IPC protocol puts every integer on the wire little-endian and
//! prefixes strings with their encoded byte count (`u32`). [`WireWriter`]
//! appends values to a growing buffer, [`WireReader`] consumes them from a
//! received payload and fails cleanly on truncated input.
//!
//! # Example
//!
//! ```
//! use netsweep_common::protocol::wire::{WireReader, WireWriter};
//!
//! let mut w = WireWriter::new();
//! w.put_u64(42);
//! w.put_str("60s");
//!
//! let mut r = WireReader::new(w.as_slice());
//! assert_eq!(r.get_u64().unwrap(), 42);
//! assert_eq!(r.get_str().unwrap(), "60s");
//! ```

use crate::protocol::error::{NetsweepError, Result};

/// Maximum length accepted for a single length-prefixed string (1 MB).
const MAX_STR_LEN: usize = 1024 * 1024;

/// Appends little-endian values to an owned byte buffer.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a string as `u32` byte count followed by the bytes.
    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Consumes little-endian values from a received payload.
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(NetsweepError::Wire(format!(
                "truncated payload: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(buf))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        if len > MAX_STR_LEN {
            return Err(NetsweepError::Wire(format!("string too long: {} bytes", len)));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| NetsweepError::Wire(format!("invalid utf-8 string: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut w = WireWriter::new();
        w.put_u8(7);
        w.put_u16(1000);
        w.put_u32(70_000);
        w.put_u64(1 << 40);
        w.put_i32(-5);
        w.put_i64(-6_000_000_000);
        w.put_f64(0.25);

        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 1000);
        assert_eq!(r.get_u32().unwrap(), 70_000);
        assert_eq!(r.get_u64().unwrap(), 1 << 40);
        assert_eq!(r.get_i32().unwrap(), -5);
        assert_eq!(r.get_i64().unwrap(), -6_000_000_000);
        assert_eq!(r.get_f64().unwrap(), 0.25);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut w = WireWriter::new();
        w.put_u32(0x0102_0304);
        assert_eq!(w.as_slice(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_string_round_trip() {
        let mut w = WireWriter::new();
        w.put_str("discovery group");
        w.put_str("");

        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.get_str().unwrap(), "discovery group");
        assert_eq!(r.get_str().unwrap(), "");
    }

    #[test]
    fn test_truncated_payload_fails() {
        let mut w = WireWriter::new();
        w.put_u32(1);

        let mut r = WireReader::new(w.as_slice());
        assert!(r.get_u64().is_err());
    }

    #[test]
    fn test_truncated_string_fails() {
        // length prefix claims 10 bytes, only 2 present
        let mut r = WireReader::new(&[10, 0, 0, 0, b'h', b'i']);
        assert!(r.get_str().is_err());
    }
}
