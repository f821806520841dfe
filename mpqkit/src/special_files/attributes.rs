//! `(attributes)`: per-block CRC32, timestamp and MD5
//!
//! Layout: `version: u32`, `flags: u32`, then one array per present flag in
//! the order CRC32, FILETIME, MD5. Every array has one entry per block.

use crate::{Error, Result};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use md5::{Digest, Md5};
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the attributes file inside an archive
pub const ATTRIBUTES_NAME: &str = "(attributes)";

/// The only attributes version in use
pub const ATTRIBUTES_VERSION: u32 = 100;

/// FILETIME of 1970-01-01 (100 ns ticks since 1601-01-01)
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// FILETIME ticks per second
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

bitflags! {
    /// Which arrays an attributes file carries
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AttributeFlags: u32 {
        /// CRC32 of the decompressed file
        const CRC32 = 0x01;
        /// FILETIME of the last modification
        const FILETIME = 0x02;
        /// MD5 of the decompressed file
        const MD5 = 0x04;
    }
}

impl AttributeFlags {
    fn entry_size(self) -> usize {
        let mut size = 0;
        if self.contains(Self::CRC32) {
            size += 4;
        }
        if self.contains(Self::FILETIME) {
            size += 8;
        }
        if self.contains(Self::MD5) {
            size += 16;
        }
        size
    }
}

/// Convert a FILETIME to POSIX seconds
pub fn filetime_to_posix(filetime: u64) -> Result<i32> {
    let ticks = filetime.checked_sub(FILETIME_UNIX_EPOCH).ok_or_else(|| {
        Error::TimeOutOfRange(format!("FILETIME {} is before 1970", filetime))
    })?;
    i32::try_from(ticks / FILETIME_TICKS_PER_SECOND).map_err(|_| {
        Error::TimeOutOfRange(format!("FILETIME {} is past the 32-bit POSIX range", filetime))
    })
}

/// Convert POSIX seconds to a FILETIME
pub fn posix_to_filetime(seconds: i32) -> Result<u64> {
    let seconds = u64::try_from(seconds)
        .map_err(|_| Error::TimeOutOfRange(format!("POSIX time {} is before 1970", seconds)))?;
    Ok(FILETIME_UNIX_EPOCH + seconds * FILETIME_TICKS_PER_SECOND)
}

/// Current time as a FILETIME, if it fits the 32-bit POSIX range
fn now_filetime() -> Option<u64> {
    let seconds = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    posix_to_filetime(i32::try_from(seconds).ok()?).ok()
}

fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&Md5::digest(data));
    digest
}

/// Attributes of one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileAttributes {
    /// CRC32 of the file data
    pub crc32: Option<u32>,
    /// Modification time as a FILETIME
    pub filetime: Option<u64>,
    /// MD5 of the file data
    pub md5: Option<[u8; 16]>,
}

impl FileAttributes {
    /// Checksums of `data`, stamped with the current time
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32: Some(crc32fast::hash(data)),
            filetime: now_filetime(),
            md5: Some(md5_digest(data)),
        }
    }

    /// Modification time in POSIX seconds
    pub fn posix_time(&self) -> Option<Result<i32>> {
        self.filetime.map(filetime_to_posix)
    }

    /// Whether the stored checksums match `data`; absent values match
    pub fn matches(&self, data: &[u8]) -> bool {
        let crc_ok = self.crc32.is_none_or(|crc| crc == crc32fast::hash(data));
        let md5_ok = self.md5.is_none_or(|md5| md5 == md5_digest(data));
        crc_ok && md5_ok
    }
}

/// A parsed attributes file
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Attributes {
    /// Format version, normally 100
    pub version: u32,
    /// Arrays present
    pub flags: AttributeFlags,
    /// One entry per block
    pub entries: Vec<FileAttributes>,
}

impl Attributes {
    /// Blank attributes for `block_count` blocks
    pub fn new(flags: AttributeFlags, block_count: usize) -> Self {
        Self {
            version: ATTRIBUTES_VERSION,
            flags,
            entries: vec![FileAttributes::default(); block_count],
        }
    }

    /// Parse an attributes file for an archive with `block_count` blocks
    ///
    /// Writers that add `(attributes)` as the last block often leave its own
    /// entry out, so `block_count - 1` entries are accepted too.
    pub fn parse(data: &[u8], block_count: usize) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let version = reader.read_u32::<LittleEndian>()?;
        if version != ATTRIBUTES_VERSION {
            return Err(Error::invalid_format(format!(
                "unsupported attributes version {}",
                version
            )));
        }
        let flags = AttributeFlags::from_bits_truncate(reader.read_u32::<LittleEndian>()?);

        let payload = data.len() - 8;
        let entry_size = flags.entry_size();
        let count = if entry_size == 0 {
            block_count
        } else if payload == block_count * entry_size {
            block_count
        } else if block_count > 0 && payload == (block_count - 1) * entry_size {
            block_count - 1
        } else {
            return Err(Error::invalid_format(format!(
                "attributes payload of {} bytes does not fit {} blocks",
                payload, block_count
            )));
        };

        let mut entries = vec![FileAttributes::default(); block_count];
        if flags.contains(AttributeFlags::CRC32) {
            for entry in entries.iter_mut().take(count) {
                entry.crc32 = Some(reader.read_u32::<LittleEndian>()?);
            }
        }
        if flags.contains(AttributeFlags::FILETIME) {
            for entry in entries.iter_mut().take(count) {
                entry.filetime = Some(reader.read_u64::<LittleEndian>()?);
            }
        }
        if flags.contains(AttributeFlags::MD5) {
            for entry in entries.iter_mut().take(count) {
                let mut md5 = [0u8; 16];
                std::io::Read::read_exact(&mut reader, &mut md5)?;
                entry.md5 = Some(md5);
            }
        }

        log::debug!(
            "parsed attributes: {:?} for {} of {} blocks",
            flags,
            count,
            block_count
        );
        Ok(Self {
            version,
            flags,
            entries,
        })
    }

    /// Attributes of a block
    pub fn get(&self, block_index: u32) -> Option<&FileAttributes> {
        self.entries.get(block_index as usize)
    }

    /// Replace the attributes of a block, growing the arrays if needed
    pub fn set(&mut self, block_index: u32, attributes: FileAttributes) {
        let index = block_index as usize;
        if index >= self.entries.len() {
            self.entries.resize(index + 1, FileAttributes::default());
        }
        self.entries[index] = attributes;
    }

    /// Serialize; missing values are written as zero
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.entries.len() * self.flags.entry_size());
        // Writing into a Vec cannot fail
        let _ = out.write_u32::<LittleEndian>(self.version);
        let _ = out.write_u32::<LittleEndian>(self.flags.bits());

        if self.flags.contains(AttributeFlags::CRC32) {
            for entry in &self.entries {
                let _ = out.write_u32::<LittleEndian>(entry.crc32.unwrap_or(0));
            }
        }
        if self.flags.contains(AttributeFlags::FILETIME) {
            for entry in &self.entries {
                let _ = out.write_u64::<LittleEndian>(entry.filetime.unwrap_or(0));
            }
        }
        if self.flags.contains(AttributeFlags::MD5) {
            for entry in &self.entries {
                out.extend_from_slice(&entry.md5.unwrap_or([0; 16]));
            }
        }
        out
    }
}
