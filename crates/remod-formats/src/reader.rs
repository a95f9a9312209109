//! Typed reading from a byte stream.
//!
//! Wraps any [`Read`] with integer reads in a fixed endianness, raw and
//! length-prefixed strings, and forward skipping. The endianness is part
//! of the reader's type, so a format picks it once. The DMF importer
//! layers this over a streaming zlib decoder, which cannot seek, so
//! [`Reader::skip`] discards bytes instead.

use std::io::{self, Read};
use std::marker::PhantomData;

use byteorder::{ByteOrder, ReadBytesExt};

pub struct Reader<R, E> {
    inner: R,
    _endian: PhantomData<E>,
}

impl<R: Read, E: ByteOrder> Reader<R, E> {
    pub fn new(inner: R) -> Self {
        Self { inner, _endian: PhantomData }
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    pub fn read_i8(&mut self) -> io::Result<i8> {
        self.inner.read_i8()
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        self.inner.read_u16::<E>()
    }

    pub fn read_i16(&mut self) -> io::Result<i16> {
        self.inner.read_i16::<E>()
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        self.inner.read_u32::<E>()
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        self.inner.read_i32::<E>()
    }

    /// Read `bytes` bytes (1..=8) as a sign-extended integer.
    pub fn read_int(&mut self, bytes: usize) -> io::Result<i64> {
        self.inner.read_int::<E>(bytes)
    }

    /// Read `bytes` bytes (1..=8) as an unsigned integer.
    pub fn read_uint(&mut self, bytes: usize) -> io::Result<u64> {
        self.inner.read_uint::<E>(bytes)
    }

    /// Read `len` raw bytes as a best-effort UTF-8 string. DMF strings are
    /// 7-bit, so the lossy conversion is normally the identity.
    pub fn read_str(&mut self, len: usize) -> io::Result<String> {
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a Pascal string: one length byte followed by that many bytes.
    pub fn read_pstr(&mut self) -> io::Result<String> {
        let len = self.read_u8()?;
        self.read_str(len as usize)
    }

    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Discard `len` bytes. The underlying stream may not support seeking.
    pub fn skip(&mut self, len: usize) -> io::Result<()> {
        let mut remaining = len as u64;
        let copied = io::copy(&mut (&mut self.inner).take(remaining), &mut io::sink())?;
        remaining -= copied;
        if remaining > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended while skipping",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, LittleEndian};

    fn le(bytes: &[u8]) -> Reader<&[u8], LittleEndian> {
        Reader::new(bytes)
    }

    #[test]
    fn little_endian_integer_reads() {
        let mut r = le(&[0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0x12345678);
    }

    #[test]
    fn big_endian_integer_reads() {
        let mut r: Reader<&[u8], BigEndian> = Reader::new(&[0x12, 0x34, 0xAB, 0xCD, 0xEF, 0x01]);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xABCDEF01);
    }

    #[test]
    fn read_int_sign_extends_from_top_byte() {
        // Two-byte -1 read into a wider integer stays -1
        let mut r = le(&[0xFF, 0xFF, 0x00, 0x80]);
        assert_eq!(r.read_int(2).unwrap(), -1);
        assert_eq!(r.read_int(2).unwrap(), -32768);
    }

    #[test]
    fn pascal_strings() {
        let mut r = le(b"\x05hellorest");
        assert_eq!(r.read_pstr().unwrap(), "hello");
        assert_eq!(r.read_str(4).unwrap(), "rest");
    }

    #[test]
    fn skip_discards_forward_only() {
        let mut r = le(&[1, 2, 3, 4, 5]);
        r.skip(3).unwrap();
        assert_eq!(r.read_u8().unwrap(), 4);
        assert!(r.skip(5).is_err());
    }

    #[test]
    fn eof_is_an_error() {
        let mut r = le(&[0x01]);
        assert!(r.read_u16().is_err());
    }
}
