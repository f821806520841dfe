//! Splitting file data into sectors and joining it back
//!
//! Packed (compressed or imploded) multi-sector files start with a table of
//! `sector_count + 1` offsets relative to the block start; the last entry is
//! the payload end. Everything else is laid out arithmetically.

use crate::compression::{self, CompressionMask};
use crate::crypto::{decrypt_bytes, encrypt_bytes};
use crate::tables::BlockFlags;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// A sector on disk, relative to its block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    /// Zero-based sector index
    pub index: usize,
    /// Offset from the block start
    pub offset: u32,
    /// Bytes stored on disk
    pub size: u32,
}

/// The shape of one stored file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLayout {
    /// Archive sector size
    pub sector_size: usize,
    /// Decompressed file size
    pub file_size: usize,
    /// Bytes the block occupies on disk
    pub block_size: usize,
    /// Block flags
    pub flags: BlockFlags,
}

impl SectorLayout {
    /// Number of sectors; single-unit files always have one
    pub fn sector_count(&self) -> usize {
        if self.file_size == 0 {
            0
        } else if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            1
        } else {
            self.file_size.div_ceil(self.sector_size)
        }
    }

    /// Whether the block starts with a sector offset table
    pub fn has_offset_table(&self) -> bool {
        self.flags.is_packed() && !self.flags.contains(BlockFlags::SINGLE_UNIT)
    }

    /// Number of entries in the offset table
    pub fn offset_table_entries(&self) -> usize {
        let extra = if self.flags.contains(BlockFlags::SECTOR_CRC) { 1 } else { 0 };
        self.sector_count() + 1 + extra
    }

    /// Decompressed size of sector `index`
    pub fn expected_size(&self, index: usize) -> usize {
        if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            return self.file_size;
        }
        let start = index * self.sector_size;
        self.file_size.saturating_sub(start).min(self.sector_size)
    }

    /// Largest size a sector may decode to
    fn decode_limit(&self) -> usize {
        if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            self.file_size
        } else {
            self.sector_size
        }
    }

    /// Sector positions of a file without an offset table
    pub fn arithmetic_sectors(&self) -> Vec<Sector> {
        if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            if self.file_size == 0 {
                return Vec::new();
            }
            return vec![Sector {
                index: 0,
                offset: 0,
                size: self.block_size as u32,
            }];
        }

        (0..self.sector_count())
            .map(|index| Sector {
                index,
                offset: (index * self.sector_size) as u32,
                size: self.expected_size(index) as u32,
            })
            .collect()
    }

    /// Parse (and decrypt) the offset table at the start of `block`
    pub fn parse_offset_table(&self, block: &[u8], key: Option<u32>) -> Result<Vec<Sector>> {
        let entries = self.offset_table_entries();
        let table_len = entries * 4;
        let mut raw = block
            .get(..table_len)
            .ok_or_else(|| {
                Error::invalid_format(format!(
                    "block of {} bytes cannot hold a {}-entry sector table",
                    block.len(),
                    entries
                ))
            })?
            .to_vec();

        if let Some(key) = key {
            decrypt_bytes(&mut raw, key.wrapping_sub(1));
        }

        let offsets: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let count = self.sector_count();
        if (offsets[0] as usize) < 4 * (count + 1) {
            return Err(Error::invalid_format(format!(
                "sector table starts data at {} inside the table",
                offsets[0]
            )));
        }

        let mut sectors = Vec::with_capacity(count);
        for index in 0..count {
            let (start, end) = (offsets[index], offsets[index + 1]);
            if end < start || end as usize > self.block_size {
                return Err(Error::invalid_format(format!(
                    "sector {} spans {}..{} outside block of {} bytes",
                    index, start, end, self.block_size
                )));
            }
            sectors.push(Sector {
                index,
                offset: start,
                size: end - start,
            });
        }

        Ok(sectors)
    }

    /// Sector positions, reading the offset table when there is one
    pub fn sectors(&self, block: &[u8], key: Option<u32>, block_index: u32) -> Result<Vec<Sector>> {
        if self.has_offset_table() && self.sector_count() > 0 {
            if self.flags.contains(BlockFlags::ENCRYPTED) && key.is_none() {
                return Err(Error::MissingPathForEncryptedSectorTable { block_index });
            }
            self.parse_offset_table(block, key)
        } else {
            Ok(self.arithmetic_sectors())
        }
    }
}

/// Decode a whole block into the file's bytes
///
/// `key` is the file key; it is required when the block is encrypted.
pub fn decode_file(
    layout: &SectorLayout,
    block: &[u8],
    key: Option<u32>,
    block_index: u32,
) -> Result<Vec<u8>> {
    let encrypted = layout.flags.contains(BlockFlags::ENCRYPTED);
    let key = if encrypted { key } else { None };
    if encrypted && key.is_none() && layout.sector_count() > 0 {
        return Err(if layout.has_offset_table() {
            Error::MissingPathForEncryptedSectorTable { block_index }
        } else {
            Error::MissingFileKey { block_index }
        });
    }

    let sectors = layout.sectors(block, key, block_index)?;
    let mut out = Vec::with_capacity(layout.file_size);

    for sector in &sectors {
        let start = sector.offset as usize;
        let end = start + sector.size as usize;
        let mut raw = block
            .get(start..end)
            .ok_or_else(|| {
                Error::invalid_format(format!(
                    "sector {} of block {} runs past the block end",
                    sector.index, block_index
                ))
            })?
            .to_vec();

        if let Some(key) = key {
            decrypt_bytes(&mut raw, key.wrapping_add(sector.index as u32));
        }

        let expected = layout.expected_size(sector.index);
        let decoded = decode_sector(layout, raw, expected, sector.index).map_err(|e| match e {
            Error::SectorSizeExceeded { actual, limit, .. } => Error::SectorSizeExceeded {
                sector: sector.index,
                actual,
                limit,
            },
            other => other,
        })?;

        if decoded.len() != expected {
            return Err(Error::invalid_format(format!(
                "sector {} of block {} decoded to {} bytes, expected {}",
                sector.index,
                block_index,
                decoded.len(),
                expected
            )));
        }

        log::trace!(
            "block {} sector {}: {} -> {} bytes",
            block_index,
            sector.index,
            sector.size,
            decoded.len()
        );
        out.extend_from_slice(&decoded);
    }

    Ok(out)
}

/// A stored sector smaller than its expected size is compressed; anything
/// else was kept raw
fn decode_sector(layout: &SectorLayout, raw: Vec<u8>, expected: usize, index: usize) -> Result<Vec<u8>> {
    if raw.len() >= expected {
        let mut raw = raw;
        raw.truncate(expected);
        return Ok(raw);
    }

    if layout.flags.contains(BlockFlags::COMPRESSED) {
        let (&mask, payload) = raw
            .split_first()
            .ok_or_else(|| Error::compression(format!("sector {} is empty", index)))?;
        compression::decompress(payload, mask, layout.decode_limit())
    } else if layout.flags.contains(BlockFlags::IMPLODED) {
        compression::explode(&raw, layout.decode_limit())
    } else {
        Err(Error::invalid_format(format!(
            "uncompressed sector {} holds {} of {} bytes",
            index,
            raw.len(),
            expected
        )))
    }
}

/// Encode file data into block bytes
///
/// `flags` selects compression, implosion, encryption and single-unit
/// storage; `key` is the file key and is required when encrypting.
pub fn encode_file(
    data: &[u8],
    sector_size: usize,
    flags: BlockFlags,
    mask: CompressionMask,
    key: Option<u32>,
) -> Result<Vec<u8>> {
    let layout = SectorLayout {
        sector_size,
        file_size: data.len(),
        block_size: 0,
        flags,
    };
    let key = if flags.contains(BlockFlags::ENCRYPTED) {
        Some(key.ok_or(Error::MissingFileKey { block_index: u32::MAX })?)
    } else {
        None
    };

    let chunks: Vec<&[u8]> = if data.is_empty() {
        Vec::new()
    } else if flags.contains(BlockFlags::SINGLE_UNIT) {
        vec![data]
    } else {
        data.chunks(sector_size).collect()
    };

    let mut sectors = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let mut stored = encode_sector(chunk, flags, mask)?;
        if let Some(key) = key {
            encrypt_bytes(&mut stored, key.wrapping_add(index as u32));
        }
        sectors.push(stored);
    }

    let payload: usize = sectors.iter().map(Vec::len).sum();
    if !layout.has_offset_table() {
        return Ok(sectors.concat());
    }

    let table_len = (chunks.len() + 1) * 4;
    let mut table = BytesMut::with_capacity(table_len);
    let mut offset = table_len as u32;
    table.put_u32_le(offset);
    for sector in &sectors {
        offset += sector.len() as u32;
        table.put_u32_le(offset);
    }

    let mut table = table.to_vec();
    if let Some(key) = key {
        encrypt_bytes(&mut table, key.wrapping_sub(1));
    }

    let mut out = BytesMut::with_capacity(table_len + payload);
    out.put_slice(&table);
    for sector in &sectors {
        out.put_slice(sector);
    }
    Ok(out.to_vec())
}

/// Keep the packed form only when it saves at least two bytes
fn encode_sector(chunk: &[u8], flags: BlockFlags, mask: CompressionMask) -> Result<Vec<u8>> {
    let packed = if flags.contains(BlockFlags::COMPRESSED) {
        let (applied, payload) = compression::compress(chunk, mask)?;
        let mut stored = Vec::with_capacity(payload.len() + 1);
        stored.push(applied.bits());
        stored.extend_from_slice(&payload);
        Some(stored)
    } else if flags.contains(BlockFlags::IMPLODED) {
        Some(compression::implode(chunk)?)
    } else {
        None
    };

    match packed {
        Some(stored) if stored.len() + 2 <= chunk.len() => Ok(stored),
        _ => Ok(chunk.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SECTOR: usize = 512;

    fn layout_for(block: &[u8], file_size: usize, flags: BlockFlags) -> SectorLayout {
        SectorLayout {
            sector_size: SECTOR,
            file_size,
            block_size: block.len(),
            flags,
        }
    }

    fn text(len: usize) -> Vec<u8> {
        b"sector payload with some repetition; "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_sector_counts() {
        let mut layout = SectorLayout {
            sector_size: SECTOR,
            file_size: 0,
            block_size: 0,
            flags: BlockFlags::EXISTS | BlockFlags::COMPRESSED,
        };
        assert_eq!(layout.sector_count(), 0);
        layout.file_size = 1;
        assert_eq!(layout.sector_count(), 1);
        layout.file_size = SECTOR;
        assert_eq!(layout.sector_count(), 1);
        layout.file_size = SECTOR + 1;
        assert_eq!(layout.sector_count(), 2);
        assert_eq!(layout.expected_size(1), 1);
        layout.flags |= BlockFlags::SINGLE_UNIT;
        assert_eq!(layout.sector_count(), 1);
        assert!(!layout.has_offset_table());
    }

    #[test]
    fn test_plain_layout_is_arithmetic() {
        let data = text(SECTOR * 2 + 10);
        let flags = BlockFlags::EXISTS;
        let block = encode_file(&data, SECTOR, flags, CompressionMask::empty(), None).unwrap();
        assert_eq!(block, data);

        let layout = layout_for(&block, data.len(), flags);
        let sectors = layout.sectors(&block, None, 0).unwrap();
        assert_eq!(sectors.len(), 3);
        assert_eq!(sectors[2].offset, (SECTOR * 2) as u32);
        assert_eq!(sectors[2].size, 10);
    }

    #[test]
    fn test_offset_table_layout() {
        let data = text(SECTOR * 2);
        let flags = BlockFlags::EXISTS | BlockFlags::COMPRESSED;
        let block = encode_file(&data, SECTOR, flags, CompressionMask::ZLIB, None).unwrap();

        let first = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        assert_eq!(first, 12);
        let last = u32::from_le_bytes([block[8], block[9], block[10], block[11]]);
        assert_eq!(last as usize, block.len());
        assert_eq!(block[12], CompressionMask::ZLIB.bits());
    }

    #[test]
    fn test_zero_size_compressed_file() {
        let flags = BlockFlags::EXISTS | BlockFlags::COMPRESSED;
        let block = encode_file(&[], SECTOR, flags, CompressionMask::ZLIB, None).unwrap();
        assert_eq!(block, 4u32.to_le_bytes().to_vec());

        let layout = layout_for(&block, 0, flags);
        assert!(decode_file(&layout, &block, None, 0).unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_sizes_and_modes() {
        let sizes = [0, 1, SECTOR - 1, SECTOR, SECTOR + 1, SECTOR * 5 + 17];
        let modes = [
            (BlockFlags::EXISTS, CompressionMask::empty()),
            (BlockFlags::EXISTS | BlockFlags::COMPRESSED, CompressionMask::ZLIB),
            (BlockFlags::EXISTS | BlockFlags::COMPRESSED, CompressionMask::BZIP2),
            (
                BlockFlags::EXISTS | BlockFlags::COMPRESSED,
                CompressionMask::HUFFMAN | CompressionMask::IMPLODE,
            ),
            (BlockFlags::EXISTS | BlockFlags::IMPLODED, CompressionMask::empty()),
            (
                BlockFlags::EXISTS | BlockFlags::COMPRESSED | BlockFlags::SINGLE_UNIT,
                CompressionMask::ZLIB,
            ),
            (
                BlockFlags::EXISTS | BlockFlags::COMPRESSED | BlockFlags::ENCRYPTED,
                CompressionMask::ZLIB,
            ),
            (BlockFlags::EXISTS | BlockFlags::ENCRYPTED, CompressionMask::empty()),
        ];

        for &(flags, mask) in &modes {
            for &size in &sizes {
                let data = text(size);
                let block = encode_file(&data, SECTOR, flags, mask, Some(0x1234_5678)).unwrap();
                let layout = layout_for(&block, size, flags);
                let decoded = decode_file(&layout, &block, Some(0x1234_5678), 7).unwrap();
                assert_eq!(decoded, data, "flags {:?} mask {:?} size {}", flags, mask, size);
            }
        }
    }

    #[test]
    fn test_incompressible_sector_stays_raw() {
        let data: Vec<u8> = (0..SECTOR as u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let flags = BlockFlags::EXISTS | BlockFlags::COMPRESSED;
        let block = encode_file(&data, SECTOR, flags, CompressionMask::ZLIB, None).unwrap();
        assert_eq!(block.len(), 8 + SECTOR);
        assert_eq!(&block[8..], &data[..]);

        let layout = layout_for(&block, data.len(), flags);
        assert_eq!(decode_file(&layout, &block, None, 0).unwrap(), data);
    }

    #[test]
    fn test_encrypted_sector_table_needs_path() {
        let data = text(SECTOR * 3);
        let flags = BlockFlags::EXISTS | BlockFlags::COMPRESSED | BlockFlags::ENCRYPTED;
        let block = encode_file(&data, SECTOR, flags, CompressionMask::ZLIB, Some(99)).unwrap();
        let layout = layout_for(&block, data.len(), flags);

        assert!(matches!(
            decode_file(&layout, &block, None, 4),
            Err(Error::MissingPathForEncryptedSectorTable { block_index: 4 })
        ));
    }

    #[test]
    fn test_encrypted_plain_file_needs_key() {
        let data = text(100);
        let flags = BlockFlags::EXISTS | BlockFlags::ENCRYPTED;
        let block = encode_file(&data, SECTOR, flags, CompressionMask::empty(), Some(5)).unwrap();
        let layout = layout_for(&block, data.len(), flags);

        assert!(matches!(
            decode_file(&layout, &block, None, 2),
            Err(Error::MissingFileKey { block_index: 2 })
        ));
        assert!(encode_file(&data, SECTOR, flags, CompressionMask::empty(), None).is_err());
    }

    #[test]
    fn test_oversized_sector_is_fatal() {
        // one sector declared as 16 bytes that inflates to 4096
        let payload = crate::compression::compress(&[0u8; 4096], CompressionMask::ZLIB)
            .unwrap()
            .1;
        let mut block = Vec::new();
        block.extend_from_slice(&8u32.to_le_bytes());
        block.extend_from_slice(&(9 + payload.len() as u32).to_le_bytes());
        block.push(CompressionMask::ZLIB.bits());
        block.extend_from_slice(&payload);

        let flags = BlockFlags::EXISTS | BlockFlags::COMPRESSED;
        let layout = SectorLayout {
            sector_size: SECTOR,
            file_size: 100,
            block_size: block.len(),
            flags,
        };
        assert!(matches!(
            decode_file(&layout, &block, None, 0),
            Err(Error::SectorSizeExceeded { sector: 0, actual: 513, limit: 512 })
        ));
    }

    #[test]
    fn test_sector_crc_entry_is_skipped() {
        let data = text(SECTOR + 40);
        let flags = BlockFlags::EXISTS | BlockFlags::COMPRESSED;
        let block = encode_file(&data, SECTOR, flags, CompressionMask::ZLIB, None).unwrap();

        // rebuild with a three-entry table plus a trailing checksum entry
        let offsets: Vec<u32> = block[..12]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) + 4)
            .collect();
        let mut with_crc = Vec::new();
        for offset in &offsets {
            with_crc.extend_from_slice(&offset.to_le_bytes());
        }
        with_crc.extend_from_slice(&offsets[2].to_le_bytes());
        with_crc.extend_from_slice(&block[12..]);

        let layout = layout_for(&with_crc, data.len(), flags | BlockFlags::SECTOR_CRC);
        assert_eq!(decode_file(&layout, &with_crc, None, 0).unwrap(), data);
    }

    #[test]
    fn test_corrupt_offsets_rejected() {
        let mut block = vec![0u8; 16];
        block[..4].copy_from_slice(&12u32.to_le_bytes());
        block[4..8].copy_from_slice(&100u32.to_le_bytes());
        let layout = layout_for(&block, 10, BlockFlags::EXISTS | BlockFlags::COMPRESSED);
        assert!(decode_file(&layout, &block, None, 0).is_err());
    }
}
