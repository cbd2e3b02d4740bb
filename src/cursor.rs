//! Bounded little-endian cursors over byte slices
//!
//! Shared by the record format and the codecs. Writers never touch bytes
//! beyond the slice they were given; readers report short input as
//! `CorruptOrTruncated`.

use crate::{OniError, Result};

/// Little-endian writer over a fixed-capacity slice
pub(crate) struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(OniError::OutputBufferOverflow {
                needed: end,
                capacity: self.buf.len(),
            });
        }
        let slot = &mut self.buf[self.pos..end];
        self.pos = end;
        Ok(slot)
    }

    pub(crate) fn put_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub(crate) fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub(crate) fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub(crate) fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub(crate) fn put_f64(&mut self, value: f64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

/// Little-endian reader over a byte slice
///
/// `base` is the file offset of the slice start and is only used for error
/// reporting.
pub(crate) struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> SliceReader<'a> {
    pub(crate) fn new(buf: &'a [u8], base: u64) -> Self {
        Self { buf, pos: 0, base }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(OniError::corrupt(
                self.base + self.pos as u64,
                format!("need {n} bytes, only {} left", self.remaining()),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn get_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub(crate) fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_le_bytes)
    }
}
