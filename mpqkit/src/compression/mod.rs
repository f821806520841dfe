//! Sector compression: the codec registry and the mask-driven chain
//!
//! A compressed sector starts with one mask byte naming every codec that
//! was applied. Decoding walks the fixed order below; encoding applies the
//! same codecs in reverse.

mod algorithms;

use crate::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Per-sector compression mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CompressionMask: u8 {
        /// Adaptive Huffman
        const HUFFMAN = 0x01;
        /// Deflate in a zlib container
        const ZLIB = 0x02;
        /// PKWare DCL implode
        const IMPLODE = 0x08;
        /// Bzip2
        const BZIP2 = 0x10;
        /// IMA ADPCM, one channel
        const ADPCM_MONO = 0x40;
        /// IMA ADPCM, two channels
        const ADPCM_STEREO = 0x80;
    }
}

impl CompressionMask {
    /// Codecs that lose information
    pub const LOSSY: Self = Self::ADPCM_MONO.union(Self::ADPCM_STEREO);

    /// Whether every codec in the mask restores the input exactly
    pub fn is_lossless(self) -> bool {
        !self.intersects(Self::LOSSY)
    }
}

/// One entry of the codec registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// PKWare DCL
    Implode,
    /// Bzip2
    Bzip2,
    /// Deflate
    Zlib,
    /// Adaptive Huffman
    Huffman,
    /// IMA ADPCM stereo
    AdpcmStereo,
    /// IMA ADPCM mono
    AdpcmMono,
}

/// Order in which a sector's codecs are undone
pub const DECODE_ORDER: [Codec; 6] = [
    Codec::Implode,
    Codec::Bzip2,
    Codec::Zlib,
    Codec::Huffman,
    Codec::AdpcmStereo,
    Codec::AdpcmMono,
];

impl Codec {
    /// Mask bit of this codec
    pub fn flag(self) -> CompressionMask {
        match self {
            Codec::Implode => CompressionMask::IMPLODE,
            Codec::Bzip2 => CompressionMask::BZIP2,
            Codec::Zlib => CompressionMask::ZLIB,
            Codec::Huffman => CompressionMask::HUFFMAN,
            Codec::AdpcmStereo => CompressionMask::ADPCM_STEREO,
            Codec::AdpcmMono => CompressionMask::ADPCM_MONO,
        }
    }

    fn encode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Implode => algorithms::pkware::implode(data),
            Codec::Bzip2 => algorithms::bzip2::compress(data),
            Codec::Zlib => algorithms::zlib::compress(data),
            Codec::Huffman => algorithms::huffman::compress(data),
            Codec::AdpcmStereo => algorithms::adpcm::compress(data, 2),
            Codec::AdpcmMono => algorithms::adpcm::compress(data, 1),
        }
    }

    fn decode(self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let output = match self {
            Codec::Implode => algorithms::pkware::explode(data, limit),
            Codec::Bzip2 => algorithms::bzip2::decompress(data, limit),
            Codec::Zlib => algorithms::zlib::decompress(data, limit),
            Codec::Huffman => algorithms::huffman::decompress(data, limit),
            Codec::AdpcmStereo => algorithms::adpcm::decompress(data, 2, limit),
            Codec::AdpcmMono => algorithms::adpcm::decompress(data, 1, limit),
        }?;
        check_limit(output, limit)
    }
}

fn parse_mask(mask: u8) -> Result<CompressionMask> {
    let parsed = CompressionMask::from_bits(mask).ok_or_else(|| {
        Error::compression(format!("unsupported compression mask 0x{:02X}", mask))
    })?;
    if parsed.contains(CompressionMask::LOSSY) {
        return Err(Error::compression(
            "mono and stereo ADPCM cannot be combined",
        ));
    }
    Ok(parsed)
}

/// Decoders never expand past one byte over the limit; anything larger
/// than `limit` is reported against sector 0 and re-tagged by the caller.
fn check_limit(output: Vec<u8>, limit: usize) -> Result<Vec<u8>> {
    if output.len() > limit {
        return Err(Error::SectorSizeExceeded {
            sector: 0,
            actual: output.len(),
            limit,
        });
    }
    Ok(output)
}

/// Undo every codec named by `mask`.
///
/// No stage may produce more than `limit` bytes. A stream that would is
/// cut off early and reported as [`Error::SectorSizeExceeded`].
pub fn decompress(data: &[u8], mask: u8, limit: usize) -> Result<Vec<u8>> {
    let mask = parse_mask(mask)?;
    log::trace!(
        "decompressing {} bytes (limit {}) with {:?}",
        data.len(),
        limit,
        mask
    );

    let mut current = data.to_vec();
    for codec in DECODE_ORDER {
        if mask.contains(codec.flag()) {
            current = codec.decode(&current, limit)?;
        }
    }
    Ok(current)
}

/// Apply the codecs of `mask` in encode order.
///
/// ADPCM is skipped for inputs that are not whole 16-bit samples; the
/// returned mask names the codecs actually applied.
pub fn compress(data: &[u8], mask: CompressionMask) -> Result<(CompressionMask, Vec<u8>)> {
    let mut mask = parse_mask(mask.bits())?;
    if data.len() % 2 != 0 {
        mask.remove(CompressionMask::LOSSY);
    }

    let mut current = data.to_vec();
    for codec in DECODE_ORDER.iter().rev() {
        if mask.contains(codec.flag()) {
            current = codec.encode(&current)?;
        }
    }
    Ok((mask, current))
}

/// Decompress an imploded (not mask-prefixed) block or sector of at most
/// `limit` bytes
pub fn explode(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    check_limit(algorithms::pkware::explode(data, limit)?, limit)
}

/// Implode a block or sector without a mask byte
pub fn implode(data: &[u8]) -> Result<Vec<u8>> {
    algorithms::pkware::implode(data)
}
