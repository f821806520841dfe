//! Block table and the v2 hi-block extension

use super::codec::{check_entry_count, TABLE_ENTRY_SIZE};
use crate::{Error, Result};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

bitflags! {
    /// Storage flags of a block
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BlockFlags: u32 {
        /// Compressed with PKWare DCL, no per-sector mask byte
        const IMPLODED = 0x0000_0100;
        /// Compressed, each sector prefixed with a codec mask
        const COMPRESSED = 0x0000_0200;
        /// Sectors are encrypted
        const ENCRYPTED = 0x0001_0000;
        /// Encryption key is bound to block offset and file size
        const FIX_KEY = 0x0002_0000;
        /// Stored as one sector regardless of size
        const SINGLE_UNIT = 0x0100_0000;
        /// Sector offset table carries a checksum entry
        const SECTOR_CRC = 0x0400_0000;
        /// Block holds a file
        const EXISTS = 0x8000_0000;
    }
}

impl BlockFlags {
    /// Either kind of compression
    pub fn is_packed(self) -> bool {
        self.intersects(BlockFlags::COMPRESSED | BlockFlags::IMPLODED)
    }
}

/// Block table entry (16 bytes plus an optional hi-word)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockEntry {
    /// Low 32 bits of the data offset, relative to the archive start
    pub offset: u32,
    /// High 16 bits of the data offset (v2 hi-block table)
    pub offset_hi: u16,
    /// Bytes occupied on disk
    pub block_size: u32,
    /// Decompressed size
    pub file_size: u32,
    /// Storage flags
    pub flags: BlockFlags,
}

impl BlockEntry {
    /// Data offset relative to the archive start
    pub fn position(&self) -> u64 {
        ((self.offset_hi as u64) << 32) | self.offset as u64
    }

    /// Set the data offset; offsets above 4 GiB need a hi-block table
    pub fn set_position(&mut self, pos: u64) -> Result<()> {
        if pos > 0xFFFF_FFFF_FFFF {
            return Err(Error::invalid_format(format!(
                "block offset {:#x} out of range",
                pos
            )));
        }
        self.offset = pos as u32;
        self.offset_hi = (pos >> 32) as u16;
        Ok(())
    }

    /// Holds a file
    pub fn exists(&self) -> bool {
        self.flags.contains(BlockFlags::EXISTS)
    }

    /// Reusable space: reserved on disk but holding no file
    pub fn is_empty(&self) -> bool {
        self.position() > 0 && self.block_size > 0 && self.file_size == 0 && self.flags.is_empty()
    }

    /// Never written
    pub fn is_unused(&self) -> bool {
        self.block_size == 0 && self.file_size == 0 && self.flags.is_empty()
    }

    /// Release the slot but keep its space reserved
    pub fn clear(&mut self) {
        self.file_size = 0;
        self.flags = BlockFlags::empty();
    }

    /// Release the slot and its space
    pub fn release(&mut self) {
        *self = Self::default();
    }

    /// End of the block's data, relative to the archive start
    pub fn end(&self) -> u64 {
        self.position() + self.block_size as u64
    }
}

/// Block table: a flat arena of block records
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockTable {
    entries: Vec<BlockEntry>,
}

impl BlockTable {
    /// A table of `size` unused blocks
    pub fn new(size: u32) -> Result<Self> {
        check_entry_count("block", size, None)?;
        Ok(Self {
            entries: vec![BlockEntry::default(); size as usize],
        })
    }

    /// Parse decrypted table bytes, merging the hi-block words if present
    pub fn from_bytes(data: &[u8], hi_block: Option<&[u8]>) -> Result<Self> {
        if data.len() % TABLE_ENTRY_SIZE != 0 {
            return Err(Error::table_mismatch(
                "block",
                format!("{} bytes is not a whole number of entries", data.len()),
            ));
        }
        let count = data.len() / TABLE_ENTRY_SIZE;

        if let Some(hi) = hi_block {
            if hi.len() != count * 2 {
                return Err(Error::table_mismatch(
                    "block",
                    format!("hi-block table has {} bytes for {} blocks", hi.len(), count),
                ));
            }
        }

        let mut cursor = Cursor::new(data);
        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let offset = cursor.read_u32::<LittleEndian>()?;
            let block_size = cursor.read_u32::<LittleEndian>()?;
            let file_size = cursor.read_u32::<LittleEndian>()?;
            let flags = BlockFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
            let offset_hi = hi_block
                .map(|hi| u16::from_le_bytes([hi[index * 2], hi[index * 2 + 1]]))
                .unwrap_or(0);

            entries.push(BlockEntry {
                offset,
                offset_hi,
                block_size,
                file_size,
                flags,
            });
        }

        Ok(Self { entries })
    }

    /// Serialize to plain (unencrypted) bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * TABLE_ENTRY_SIZE);
        for entry in &self.entries {
            // Writes into a Vec cannot fail
            let _ = buf.write_u32::<LittleEndian>(entry.offset);
            let _ = buf.write_u32::<LittleEndian>(entry.block_size);
            let _ = buf.write_u32::<LittleEndian>(entry.file_size);
            let _ = buf.write_u32::<LittleEndian>(entry.flags.bits());
        }
        buf
    }

    /// Serialize the hi-block words (stored unencrypted)
    pub fn hi_block_bytes(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|entry| entry.offset_hi.to_le_bytes())
            .collect()
    }

    /// Whether any block needs a hi-block word
    pub fn needs_hi_block(&self) -> bool {
        self.entries.iter().any(|entry| entry.offset_hi != 0)
    }

    /// Number of blocks
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// All blocks
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// One block
    pub fn get(&self, index: u32) -> Option<&BlockEntry> {
        self.entries.get(index as usize)
    }

    /// One block, mutably
    pub fn get_mut(&mut self, index: u32) -> Option<&mut BlockEntry> {
        self.entries.get_mut(index as usize)
    }

    /// End of the furthest stored block, or `floor` if nothing is stored
    pub fn data_end(&self, floor: u64) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.block_size > 0)
            .map(BlockEntry::end)
            .fold(floor, u64::max)
    }

    /// First empty block with at least `needed` bytes reserved
    pub fn find_empty_fit(&self, needed: u32) -> Option<u32> {
        self.entries
            .iter()
            .position(|entry| entry.is_empty() && entry.block_size >= needed)
            .map(|index| index as u32)
    }

    /// First never-written block
    pub fn find_unused(&self) -> Option<u32> {
        self.entries
            .iter()
            .position(BlockEntry::is_unused)
            .map(|index| index as u32)
    }

    /// First empty block regardless of its reserved size
    pub fn find_empty(&self) -> Option<u32> {
        self.entries
            .iter()
            .position(BlockEntry::is_empty)
            .map(|index| index as u32)
    }

    /// Shrink empty block `index` to `needed` bytes.
    ///
    /// The cut-off tail becomes a new empty block in the first never-written
    /// entry, whose index is returned. Without such an entry the tail stays
    /// unreferenced until the region behind it is rewritten.
    pub fn split_empty(&mut self, index: u32, needed: u32) -> Result<Option<u32>> {
        let Some(entry) = self.get(index).copied() else {
            return Ok(None);
        };
        if !entry.is_empty() || entry.block_size <= needed {
            return Ok(None);
        }

        let spare = self.find_unused();
        if let Some(spare) = spare {
            let rest = &mut self.entries[spare as usize];
            rest.set_position(entry.position() + needed as u64)?;
            rest.block_size = entry.block_size - needed;
        } else {
            log::debug!(
                "no free block entry for the {} spare bytes of block {}",
                entry.block_size - needed,
                index
            );
        }
        self.entries[index as usize].block_size = needed;
        Ok(spare)
    }

    /// Release empty blocks that end the data region, so the tables can
    /// move down over them. Returns how many were released.
    pub fn trim_trailing_empty(&mut self) -> usize {
        let mut released = 0;
        while let Some(index) = (0..self.entries.len() as u32)
            .find(|&i| self.entries[i as usize].is_empty() && self.is_last_stored(i))
        {
            self.entries[index as usize].release();
            released += 1;
        }
        released
    }

    /// Whether `index` holds the data that ends furthest into the archive
    pub fn is_last_stored(&self, index: u32) -> bool {
        let Some(target) = self.get(index) else {
            return false;
        };
        let end = target.end();
        self.entries
            .iter()
            .enumerate()
            .all(|(i, entry)| i == index as usize || entry.block_size == 0 || entry.end() <= end)
    }
}
