//! Deflate (zlib container) via flate2

use crate::{Error, Result};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::io::Write;

/// Compress data with zlib at the best level
pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| Error::compression(format!("zlib compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::compression(format!("zlib compression failed: {}", e)))
}

/// Decompress a zlib stream, stopping one byte past `limit`
pub(crate) fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    super::read_capped(ZlibDecoder::new(data), limit)
        .map_err(|e| Error::compression(format!("zlib decompression failed: {}", e)))
}
