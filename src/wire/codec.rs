//! Fixed-endian primitive codec.
//!
//! Every integer on the wire is big-endian, matching the source's use of
//! `htons`/`htonl`-style framing rather than the host's native layout.
//! Strings are a `u16` byte length followed by that many bytes — no NUL
//! terminator. Binary payloads (write/read data, key-transfer chunks) use
//! a wider `u32` length prefix since they can exceed 64 KiB in aggregate
//! even though a single datagram cannot.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Appends big-endian primitives and length-prefixed strings/bytes to a
/// growable buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.write_u16::<BigEndian>(v).expect("write to Vec never fails");
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.write_u32::<BigEndian>(v).expect("write to Vec never fails");
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.write_u64::<BigEndian>(v).expect("write to Vec never fails");
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.write_i32::<BigEndian>(v).expect("write to Vec never fails");
    }

    /// `u16` length prefix followed by the raw bytes.
    pub fn str(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.write_all(s.as_bytes()).expect("write to Vec never fails");
    }

    /// `u32` length prefix followed by the raw bytes.
    pub fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.write_all(b).expect("write to Vec never fails");
    }

    /// A bare 20-byte binary hash, no length prefix (the length is fixed).
    pub fn fixed20(&mut self, b: &[u8; 20]) {
        self.buf.write_all(b).expect("write to Vec never fails");
    }
}

/// Reads big-endian primitives and length-prefixed strings/bytes out of a
/// borrowed datagram buffer.
pub struct Reader<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { cur: Cursor::new(buf) }
    }

    fn wrap<T>(r: std::io::Result<T>) -> Result<T> {
        r.map_err(|_| Error::Protocol("short or malformed datagram".to_string()))
    }

    pub fn u8(&mut self) -> Result<u8> {
        Self::wrap(self.cur.read_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        Self::wrap(self.cur.read_u16::<BigEndian>())
    }

    pub fn u32(&mut self) -> Result<u32> {
        Self::wrap(self.cur.read_u32::<BigEndian>())
    }

    pub fn u64(&mut self) -> Result<u64> {
        Self::wrap(self.cur.read_u64::<BigEndian>())
    }

    pub fn i32(&mut self) -> Result<i32> {
        Self::wrap(self.cur.read_i32::<BigEndian>())
    }

    pub fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let mut buf = vec![0u8; len];
        Self::wrap(self.cur.read_exact(&mut buf))?;
        String::from_utf8(buf).map_err(|_| Error::Protocol("non-utf8 string on wire".to_string()))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        let mut buf = vec![0u8; len];
        Self::wrap(self.cur.read_exact(&mut buf))?;
        Ok(buf)
    }

    pub fn fixed20(&mut self) -> Result<[u8; 20]> {
        let mut buf = [0u8; 20];
        Self::wrap(self.cur.read_exact(&mut buf))?;
        Ok(buf)
    }

    /// Bytes remaining in the buffer (used to check a request was fully
    /// consumed, or to grab a trailing raw payload of known-by-context
    /// length).
    pub fn remaining(&self) -> usize {
        let pos = self.cur.position() as usize;
        self.cur.get_ref().len().saturating_sub(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        let mut w = Writer::new();
        w.u8(7);
        w.u16(1234);
        w.u32(0xdead_beef);
        w.u64(0x0102_0304_0506_0708);
        w.i32(-5);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 1234);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.i32().unwrap(), -5);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn string_and_bytes_roundtrip() {
        let mut w = Writer::new();
        w.str("/path/to/flare");
        w.bytes(b"hello world");
        let buf = w.into_bytes();

        let mut r = Reader::new(&buf);
        assert_eq!(r.str().unwrap(), "/path/to/flare");
        assert_eq!(r.bytes().unwrap(), b"hello world");
    }

    #[test]
    fn fixed20_roundtrip() {
        let hash: [u8; 20] = [9; 20];
        let mut w = Writer::new();
        w.fixed20(&hash);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(r.fixed20().unwrap(), hash);
    }

    #[test]
    fn reader_reports_protocol_error_on_truncation() {
        let mut r = Reader::new(&[0, 1]);
        assert!(r.u32().is_err());
    }
}
