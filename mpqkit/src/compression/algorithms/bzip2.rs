//! Bzip2 via the bzip2 crate

use crate::{Error, Result};
use bzip2::{read::BzDecoder, write::BzEncoder, Compression};
use std::io::Write;

/// Compress data with bzip2 at the best level
pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| Error::compression(format!("bzip2 compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::compression(format!("bzip2 compression failed: {}", e)))
}

/// Decompress a bzip2 stream, stopping one byte past `limit`
pub(crate) fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    super::read_capped(BzDecoder::new(data), limit)
        .map_err(|e| Error::compression(format!("bzip2 decompression failed: {}", e)))
}
