//! Archive header location, parsing and serialization

use crate::error::{ArchiveWarning, Error, Result};
use crate::{is_power_of_two, signatures, FormatVersion};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

/// Size of the v1 header
pub const HEADER_SIZE_V1: u32 = 32;

/// Size of the v2 header
pub const HEADER_SIZE_V2: u32 = 44;

/// Size of a user data header
pub const USER_DATA_HEADER_SIZE: u32 = 16;

/// Chunk size used while scanning for the header
const SCAN_CHUNK: usize = 0x10000;

impl FormatVersion {
    /// Header size written for this version
    pub fn header_size(self) -> u32 {
        match self {
            FormatVersion::V1 => HEADER_SIZE_V1,
            FormatVersion::V2 => HEADER_SIZE_V2,
        }
    }

    /// Parse the on-disk version field
    pub fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(FormatVersion::V1),
            1 => Ok(FormatVersion::V2),
            other => Err(Error::UnsupportedFormatVersion(other)),
        }
    }
}

/// `MPQ\x1B` block that may precede the real header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserDataHeader {
    /// Maximum size of the user data
    pub user_data_size: u32,
    /// Offset of the archive header, relative to this block
    pub header_offset: u32,
    /// Size of this header block
    pub user_data_header_size: u32,
}

/// MPQ archive header (v1 fields plus the v2 extension)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MpqHeader {
    /// Size of the header in bytes
    pub header_size: u32,
    /// Size of the archive in bytes
    pub archive_size: u32,
    /// Format version
    pub format_version: FormatVersion,
    /// Sector size as a power of two above 512
    pub sector_size_shift: u16,
    /// Low 32 bits of the hash table offset
    pub hash_table_offset: u32,
    /// Low 32 bits of the block table offset
    pub block_table_offset: u32,
    /// Number of hash table entries
    pub hash_table_entries: u32,
    /// Number of block table entries
    pub block_table_entries: u32,
    /// Offset of the hi-block table (v2, 0 when absent)
    pub hi_block_table_offset: u64,
    /// High 16 bits of the hash table offset (v2)
    pub hash_table_offset_hi: u16,
    /// High 16 bits of the block table offset (v2)
    pub block_table_offset_hi: u16,
}

impl MpqHeader {
    /// Fresh header for an empty archive
    pub fn new(format_version: FormatVersion, sector_size_shift: u16) -> Self {
        let header_size = format_version.header_size();
        Self {
            header_size,
            archive_size: header_size,
            format_version,
            sector_size_shift,
            hash_table_offset: header_size,
            block_table_offset: header_size,
            hash_table_entries: 0,
            block_table_entries: 0,
            hi_block_table_offset: 0,
            hash_table_offset_hi: 0,
            block_table_offset_hi: 0,
        }
    }

    /// Sector size in bytes
    pub fn sector_size(&self) -> usize {
        crate::calculate_sector_size(self.sector_size_shift)
    }

    /// Hash table offset relative to the archive start
    pub fn hash_table_pos(&self) -> u64 {
        ((self.hash_table_offset_hi as u64) << 32) | self.hash_table_offset as u64
    }

    /// Block table offset relative to the archive start
    pub fn block_table_pos(&self) -> u64 {
        ((self.block_table_offset_hi as u64) << 32) | self.block_table_offset as u64
    }

    /// Hi-block table offset, if the archive carries one
    pub fn hi_block_table_pos(&self) -> Option<u64> {
        match self.format_version {
            FormatVersion::V2 if self.hi_block_table_offset != 0 => {
                Some(self.hi_block_table_offset)
            }
            _ => None,
        }
    }

    /// Set the hash table offset, splitting it for v2
    pub fn set_hash_table_pos(&mut self, pos: u64) -> Result<()> {
        let (low, high) = self.split_offset(pos)?;
        self.hash_table_offset = low;
        self.hash_table_offset_hi = high;
        Ok(())
    }

    /// Set the block table offset, splitting it for v2
    pub fn set_block_table_pos(&mut self, pos: u64) -> Result<()> {
        let (low, high) = self.split_offset(pos)?;
        self.block_table_offset = low;
        self.block_table_offset_hi = high;
        Ok(())
    }

    fn split_offset(&self, pos: u64) -> Result<(u32, u16)> {
        let limit = match self.format_version {
            FormatVersion::V1 => u32::MAX as u64,
            FormatVersion::V2 => 0xFFFF_FFFF_FFFF,
        };
        if pos > limit {
            return Err(Error::invalid_format(format!(
                "offset {:#x} does not fit a {:?} archive",
                pos, self.format_version
            )));
        }
        Ok((pos as u32, (pos >> 32) as u16))
    }

    /// Parse a header; the reader is positioned on the magic
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != signatures::MPQ_ARCHIVE {
            return Err(Error::MissingMagic);
        }

        let header_size = reader.read_u32::<LittleEndian>()?;
        let archive_size = reader.read_u32::<LittleEndian>()?;
        let format_version = FormatVersion::from_raw(reader.read_u16::<LittleEndian>()?)?;
        let sector_size_shift = reader.read_u16::<LittleEndian>()?;
        let hash_table_offset = reader.read_u32::<LittleEndian>()?;
        let block_table_offset = reader.read_u32::<LittleEndian>()?;
        let hash_table_entries = reader.read_u32::<LittleEndian>()?;
        let block_table_entries = reader.read_u32::<LittleEndian>()?;

        let mut header = Self {
            header_size,
            archive_size,
            format_version,
            sector_size_shift,
            hash_table_offset,
            block_table_offset,
            hash_table_entries,
            block_table_entries,
            hi_block_table_offset: 0,
            hash_table_offset_hi: 0,
            block_table_offset_hi: 0,
        };

        if format_version == FormatVersion::V2 {
            header.hi_block_table_offset = reader.read_u64::<LittleEndian>()?;
            header.hash_table_offset_hi = reader.read_u16::<LittleEndian>()?;
            header.block_table_offset_hi = reader.read_u16::<LittleEndian>()?;
        }

        if sector_size_shift > 23 {
            return Err(Error::invalid_format(format!(
                "sector size shift {} is out of range",
                sector_size_shift
            )));
        }

        Ok(header)
    }

    /// Serialize the header
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(signatures::MPQ_ARCHIVE)?;
        writer.write_u32::<LittleEndian>(self.format_version.header_size())?;
        writer.write_u32::<LittleEndian>(self.archive_size)?;
        writer.write_u16::<LittleEndian>(self.format_version as u16)?;
        writer.write_u16::<LittleEndian>(self.sector_size_shift)?;
        writer.write_u32::<LittleEndian>(self.hash_table_offset)?;
        writer.write_u32::<LittleEndian>(self.block_table_offset)?;
        writer.write_u32::<LittleEndian>(self.hash_table_entries)?;
        writer.write_u32::<LittleEndian>(self.block_table_entries)?;

        if self.format_version == FormatVersion::V2 {
            writer.write_u64::<LittleEndian>(self.hi_block_table_offset)?;
            writer.write_u16::<LittleEndian>(self.hash_table_offset_hi)?;
            writer.write_u16::<LittleEndian>(self.block_table_offset_hi)?;
        }

        Ok(())
    }

    /// Serialize the header into a buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.format_version.header_size() as usize);
        // Writing into a Vec cannot fail
        let _ = self.write(&mut buf);
        buf
    }

    /// End of the furthest table, relative to the archive start
    pub fn tables_end(&self) -> u64 {
        let hash_end = self.hash_table_pos() + self.hash_table_entries as u64 * 16;
        let block_end = self.block_table_pos() + self.block_table_entries as u64 * 16;
        let hi_end = self
            .hi_block_table_pos()
            .map(|pos| pos + self.block_table_entries as u64 * 2)
            .unwrap_or(0);
        hash_end.max(block_end).max(hi_end)
    }

    /// Report the tolerated inconsistencies of this header
    pub fn validate(&self) -> Vec<ArchiveWarning> {
        let mut warnings = Vec::new();

        let expected = self.format_version.header_size();
        if self.header_size != expected {
            warnings.push(ArchiveWarning::HeaderSizeMismatch {
                declared: self.header_size,
                expected,
            });
        }

        let computed = self.tables_end();
        if self.archive_size as u64 != computed {
            warnings.push(ArchiveWarning::ArchiveSizeMismatch {
                declared: self.archive_size as u64,
                computed,
            });
        }

        if !is_power_of_two(self.hash_table_entries) {
            warnings.push(ArchiveWarning::HashTableNotPowerOfTwo(
                self.hash_table_entries,
            ));
        }

        for warning in &warnings {
            log::warn!("tolerating archive header inconsistency: {}", warning);
        }

        warnings
    }
}

impl UserDataHeader {
    /// Parse a user data header; the reader is positioned on the magic
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != signatures::MPQ_USERDATA {
            return Err(Error::MissingMagic);
        }
        Ok(Self {
            user_data_size: reader.read_u32::<LittleEndian>()?,
            header_offset: reader.read_u32::<LittleEndian>()?,
            user_data_header_size: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Where the archive header was found in its containing stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLocation {
    /// Absolute offset of `MPQ\x1A`; every archive offset is relative to it
    pub archive_offset: u64,
    /// The parsed header
    pub header: MpqHeader,
    /// User data block that pointed at the header, if any
    pub user_data: Option<UserDataHeader>,
}

/// Scan a stream for the archive header
///
/// The magic may sit at any byte offset; a `MPQ\x1B` user data block is
/// followed to the header it points at.
pub fn find_header<R: Read + Seek>(reader: &mut R) -> Result<HeaderLocation> {
    let stream_len = reader.seek(SeekFrom::End(0))?;
    let mut buffer = vec![0u8; SCAN_CHUNK];
    let mut base = 0u64;
    // First hard parse failure, reported if no usable header turns up
    let mut deferred: Option<Error> = None;

    while base + 4 <= stream_len {
        let len = ((stream_len - base) as usize).min(SCAN_CHUNK);
        reader.seek(SeekFrom::Start(base))?;
        reader.read_exact(&mut buffer[..len])?;

        for i in 0..len.saturating_sub(3) {
            let word = u32::from_le_bytes([buffer[i], buffer[i + 1], buffer[i + 2], buffer[i + 3]]);
            let pos = base + i as u64;

            if word == signatures::MPQ_ARCHIVE {
                reader.seek(SeekFrom::Start(pos))?;
                match MpqHeader::read(reader) {
                    Ok(header) => {
                        log::debug!("found archive header at {:#x}", pos);
                        return Ok(HeaderLocation {
                            archive_offset: pos,
                            header,
                            user_data: None,
                        });
                    }
                    Err(Error::Io(_)) => continue,
                    Err(e) => {
                        log::debug!("skipping unusable header at {:#x}: {}", pos, e);
                        deferred.get_or_insert(e);
                        continue;
                    }
                }
            }

            if word == signatures::MPQ_USERDATA {
                if let Some(location) = follow_user_data(reader, pos, stream_len)? {
                    return Ok(location);
                }
            }
        }

        if len < SCAN_CHUNK {
            break;
        }
        base += (len - 3) as u64;
    }

    Err(deferred.unwrap_or(Error::MissingMagic))
}

fn follow_user_data<R: Read + Seek>(
    reader: &mut R,
    pos: u64,
    stream_len: u64,
) -> Result<Option<HeaderLocation>> {
    reader.seek(SeekFrom::Start(pos))?;
    let user_data = match UserDataHeader::read(reader) {
        Ok(user_data) => user_data,
        Err(Error::Io(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let header_pos = pos + user_data.header_offset as u64;
    if user_data.header_offset == 0 || header_pos + HEADER_SIZE_V1 as u64 > stream_len {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(header_pos))?;
    match MpqHeader::read(reader) {
        Ok(header) => {
            log::debug!(
                "found archive header at {:#x} via user data at {:#x}",
                header_pos,
                pos
            );
            Ok(Some(HeaderLocation {
                archive_offset: header_pos,
                header,
                user_data: Some(user_data),
            }))
        }
        Err(Error::Io(_)) | Err(Error::MissingMagic) => Ok(None),
        Err(e) => Err(e),
    }
}
