//! Error and warning types for archive operations

use std::fmt;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by archive, table and codec operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No `MPQ\x1A` header was found anywhere in the stream
    #[error("No MPQ header found in stream")]
    MissingMagic,

    /// The header declares a format version this crate does not handle
    #[error("Unsupported MPQ format version: {0}")]
    UnsupportedFormatVersion(u16),

    /// A table declares more entries than the sentinel range allows
    #[error("{table} table too large: {entries} entries")]
    TableTooLarge {
        /// Which table ("hash" or "block")
        table: &'static str,
        /// Declared entry count
        entries: u64,
    },

    /// A decrypted table failed its structural checks
    #[error("Decrypted {table} table is inconsistent: {reason}")]
    TableDecryptMismatch {
        /// Which table ("hash" or "block")
        table: &'static str,
        /// What check failed
        reason: String,
    },

    /// A sector decoded larger than the space reserved for it
    #[error("Sector {sector} decoded to {actual} bytes, limit is {limit}")]
    SectorSizeExceeded {
        /// Sector index within the file
        sector: usize,
        /// Bytes decoded before giving up, normally `limit + 1`
        actual: usize,
        /// Maximum allowed size
        limit: usize,
    },

    /// The sector offset table is encrypted and the file path is unknown
    #[error("Sector offset table of block {block_index} is encrypted and the file path is unknown")]
    MissingPathForEncryptedSectorTable {
        /// Block index of the file
        block_index: u32,
    },

    /// The file data is encrypted and the file path is unknown
    #[error("File key for block {block_index} cannot be derived without its path")]
    MissingFileKey {
        /// Block index of the file
        block_index: u32,
    },

    /// Hash or block table is full
    #[error("No free {0} slot left in archive")]
    NoFreeHashOrBlockSlot(&'static str),

    /// Requested file is not in the archive
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// File with the same path, locale and platform already exists
    #[error("File already exists: {0}")]
    FileExists(String),

    /// Malformed data that does not fit any other category
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Mutation attempted on an archive opened read-only
    #[error("Archive was opened read-only")]
    ReadOnly,

    /// The advisory writer lock could not be acquired
    #[error("Archive is locked by another writer: {0}")]
    Locked(String),

    /// Signature parsing or verification failure
    #[error("Signature error: {0}")]
    Signature(String),

    /// FILETIME value outside the 32-bit POSIX range
    #[error("Timestamp out of range: {0}")]
    TimeOutOfRange(String),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFormat(msg.into())
    }

    /// Create a compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Error::Compression(msg.into())
    }

    /// Create a signature error
    pub fn signature<S: Into<String>>(msg: S) -> Self {
        Error::Signature(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a table mismatch error
    pub fn table_mismatch<S: Into<String>>(table: &'static str, reason: S) -> Self {
        Error::TableDecryptMismatch {
            table,
            reason: reason.into(),
        }
    }

    /// Whether the error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::MissingMagic
                | Error::TableDecryptMismatch { .. }
                | Error::SectorSizeExceeded { .. }
                | Error::InvalidFormat(_)
                | Error::Compression(_)
        )
    }

    /// Whether supplying the file path (e.g. from a listfile) would let the
    /// operation succeed
    pub fn needs_path(&self) -> bool {
        matches!(
            self,
            Error::MissingPathForEncryptedSectorTable { .. } | Error::MissingFileKey { .. }
        )
    }
}

/// Non-fatal inconsistencies found while opening an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveWarning {
    /// Header size field does not match the format version
    HeaderSizeMismatch {
        /// Value stored in the header
        declared: u32,
        /// Size implied by the format version
        expected: u32,
    },
    /// Archive size field does not match the data actually present
    ArchiveSizeMismatch {
        /// Value stored in the header
        declared: u64,
        /// Size computed from table positions
        computed: u64,
    },
    /// Hash table entry count is not a power of two
    HashTableNotPowerOfTwo(u32),
    /// A block points past the end of the archive
    BlockOutOfBounds {
        /// Block index
        block_index: u32,
    },
}

impl fmt::Display for ArchiveWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveWarning::HeaderSizeMismatch { declared, expected } => write!(
                f,
                "header size {} does not match expected {}",
                declared, expected
            ),
            ArchiveWarning::ArchiveSizeMismatch { declared, computed } => write!(
                f,
                "archive size {} does not match computed {}",
                declared, computed
            ),
            ArchiveWarning::HashTableNotPowerOfTwo(n) => {
                write!(f, "hash table size {} is not a power of two", n)
            }
            ArchiveWarning::BlockOutOfBounds { block_index } => {
                write!(f, "block {} lies outside the archive", block_index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SectorSizeExceeded {
            sector: 2,
            actual: 5000,
            limit: 4096,
        };
        assert_eq!(
            err.to_string(),
            "Sector 2 decoded to 5000 bytes, limit is 4096"
        );

        let err = Error::TableTooLarge {
            table: "hash",
            entries: 0xFFFF_FFFE,
        };
        assert!(err.to_string().contains("hash table too large"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::MissingMagic.is_corruption());
        assert!(Error::table_mismatch("block", "bad").is_corruption());
        assert!(!Error::ReadOnly.is_corruption());

        assert!(Error::MissingPathForEncryptedSectorTable { block_index: 3 }.needs_path());
        assert!(Error::MissingFileKey { block_index: 3 }.needs_path());
        assert!(!Error::FileNotFound("x".into()).needs_path());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_warning_display() {
        let warning = ArchiveWarning::HashTableNotPowerOfTwo(3);
        assert_eq!(warning.to_string(), "hash table size 3 is not a power of two");
    }
}
