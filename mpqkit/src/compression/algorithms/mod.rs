//! Compression algorithm implementations
//!
//! Decoders take the largest output the caller will accept and stop one
//! byte past it, so an oversized stream is detected without being fully
//! expanded.

pub(super) mod adpcm;
mod bits;
pub(super) mod bzip2;
pub(super) mod huffman;
pub(super) mod pkware;
pub(super) mod zlib;

use std::io::Read;

/// Largest allocation made up front for a decoder's output
const PREALLOCATE_LIMIT: usize = 1 << 20;

fn output_buffer(limit: usize) -> Vec<u8> {
    Vec::with_capacity(limit.saturating_add(1).min(PREALLOCATE_LIMIT))
}

/// Read at most `limit + 1` decoded bytes
fn read_capped<R: Read>(reader: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = output_buffer(limit);
    reader
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    Ok(out)
}
