//! Positioned I/O over archive streams

use crate::Result;
use std::io::{Read, Seek, SeekFrom, Write};

/// Positioned reads for any seekable stream
pub trait MpqRead: Read + Seek {
    /// Read exactly `buf.len()` bytes at `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)?;
        Ok(())
    }

    /// Read `len` bytes at `offset` into a new buffer
    fn read_vec_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Total length of the stream
    fn total_len(&mut self) -> Result<u64> {
        Ok(self.seek(SeekFrom::End(0))?)
    }
}

impl<R: Read + Seek> MpqRead for R {}

/// Positioned writes for any seekable stream
pub trait MpqWrite: Write + Seek {
    /// Write all of `buf` at `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)?;
        Ok(())
    }
}

impl<W: Write + Seek> MpqWrite for W {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_positioned_access() {
        let mut cursor = Cursor::new(vec![0u8; 8]);
        cursor.write_at(3, b"abc").unwrap();
        assert_eq!(cursor.read_vec_at(2, 4).unwrap(), b"\0abc");
        assert_eq!(cursor.total_len().unwrap(), 8);
        assert!(cursor.read_vec_at(6, 4).is_err());
    }
}
