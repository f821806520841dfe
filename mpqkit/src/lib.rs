//! # mpqkit - random-access MPQ archives
//!
//! Read, create and modify MPQ (Mo'PaQ) archives in place: look files up
//! through the hash table, decode their sectors, and add or remove files
//! while keeping the hash and block tables consistent.
//!
//! Version 1 (32-byte header) and version 2 (44-byte header, 64-bit block
//! offsets) archives are supported, including archives embedded after
//! arbitrary prefix data or behind a user data header.
//!
//! ## Example
//!
//! ```no_run
//! use mpqkit::{AddFileOptions, Archive, ArchiveConfig};
//!
//! # fn main() -> Result<(), mpqkit::Error> {
//! let mut archive = Archive::create("patch.mpq", ArchiveConfig::default())?;
//! archive.add_file("scripts\\war3map.j", b"function main takes nothing", &AddFileOptions::new())?;
//!
//! let data = archive.read_file_by_name("scripts\\war3map.j")?;
//! assert_eq!(data, b"function main takes nothing");
//!
//! for file in archive.files()? {
//!     println!("{:?} {} bytes", file.path, file.file_size());
//! }
//! archive.close()?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod archive;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod error;
pub mod header;
pub mod io;
pub mod lock;
pub mod sector;
pub mod special_files;
pub mod tables;

// Re-export commonly used types
pub use archive::{AddFileOptions, Archive, LogicalFile, LOCALE_NEUTRAL, PLATFORM_DEFAULT};
pub use compression::CompressionMask;
pub use config::{ArchiveConfig, OpenOptions};
pub use error::{ArchiveWarning, Error, Result};
pub use header::MpqHeader;
pub use special_files::{Attributes, Listfile, SignatureStatus};
pub use tables::{BlockFlags, BlockTable, HashTable};

/// MPQ format version
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FormatVersion {
    /// Original format (32-byte header)
    V1 = 0,
    /// The Burning Crusade format (44-byte header, hi-block table)
    V2 = 1,
}

/// MPQ signature constants
pub mod signatures {
    /// Standard MPQ archive signature ('MPQ\x1A')
    pub const MPQ_ARCHIVE: u32 = 0x1A51504D;

    /// MPQ user data signature ('MPQ\x1B')
    pub const MPQ_USERDATA: u32 = 0x1B51504D;

    /// Strong signature magic ('NGIS')
    pub const STRONG_SIGNATURE: [u8; 4] = *b"NGIS";
}

/// Sector size for a header's shift value
#[inline]
pub fn calculate_sector_size(sector_size_shift: u16) -> usize {
    512 << sector_size_shift
}

/// Check if a value is a power of two
#[inline]
pub fn is_power_of_two(value: u32) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_size_calculation() {
        assert_eq!(calculate_sector_size(0), 512);
        assert_eq!(calculate_sector_size(3), 4096);
        assert_eq!(calculate_sector_size(8), 131072);
    }

    #[test]
    fn test_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(1024));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(3));
        assert!(!is_power_of_two(1023));
    }

    #[test]
    fn test_signature_bytes() {
        assert_eq!(&signatures::MPQ_ARCHIVE.to_le_bytes(), b"MPQ\x1A");
        assert_eq!(&signatures::MPQ_USERDATA.to_le_bytes(), b"MPQ\x1B");
    }
}
