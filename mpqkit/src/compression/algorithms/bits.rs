//! LSB-first bit streams shared by the in-crate codecs

use crate::{Error, Result};

/// Reads bits least-significant first
#[derive(Debug)]
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buffer: u32,
    available: u32,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            buffer: 0,
            available: 0,
        }
    }

    /// Read `count` bits (at most 24), first bit in the lowest position
    pub(crate) fn bits(&mut self, count: u32) -> Result<u32> {
        debug_assert!(count <= 24);
        while self.available < count {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| Error::compression("unexpected end of bit stream"))?;
            self.buffer |= (byte as u32) << self.available;
            self.available += 8;
            self.pos += 1;
        }
        let value = self.buffer & ((1u32 << count) - 1);
        self.buffer >>= count;
        self.available -= count;
        Ok(value)
    }

    pub(crate) fn bit(&mut self) -> Result<u32> {
        self.bits(1)
    }
}

/// Writes bits least-significant first
#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    out: Vec<u8>,
    buffer: u32,
    used: u32,
}

impl BitWriter {
    pub(crate) fn with_prefix(prefix: &[u8], capacity: usize) -> Self {
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(prefix);
        Self {
            out,
            buffer: 0,
            used: 0,
        }
    }

    /// Write the low `count` bits of `value` (at most 24)
    pub(crate) fn bits(&mut self, value: u32, count: u32) {
        debug_assert!(count <= 24);
        if count == 0 {
            return;
        }
        self.buffer |= (value & ((1u32 << count) - 1)) << self.used;
        self.used += count;
        while self.used >= 8 {
            self.out.push(self.buffer as u8);
            self.buffer >>= 8;
            self.used -= 8;
        }
    }

    pub(crate) fn bit(&mut self, value: u32) {
        self.bits(value, 1)
    }

    /// Flush the partial byte, zero padded
    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.out.push(self.buffer as u8);
        }
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsb_first_order() {
        let mut writer = BitWriter::default();
        writer.bit(1);
        writer.bits(0b10, 2);
        writer.bits(0x1F, 5);
        writer.bits(0xABC, 12);
        let bytes = writer.finish();
        assert_eq!(bytes[0], 0b1111_1101);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.bit().unwrap(), 1);
        assert_eq!(reader.bits(2).unwrap(), 0b10);
        assert_eq!(reader.bits(5).unwrap(), 0x1F);
        assert_eq!(reader.bits(12).unwrap(), 0xABC);
    }

    #[test]
    fn test_reader_eof() {
        let mut reader = BitReader::new(&[0xFF]);
        assert!(reader.bits(8).is_ok());
        assert!(reader.bit().is_err());
    }
}
