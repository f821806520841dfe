//! Archive configuration and open options

use crate::compression::CompressionMask;
use crate::error::{Error, Result};
use crate::FormatVersion;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Defaults applied when creating archives and adding files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Format version for newly created archives
    pub format_version: FormatVersion,

    /// Sector size shift for newly created archives (sector = 512 << shift)
    pub sector_size_shift: u16,

    /// Compression applied by `add_file` when the caller does not choose
    pub compression: CompressionMask,

    /// Hash table entries for newly created archives
    pub hash_table_entries: u32,

    /// Block table entries for newly created archives
    pub block_table_entries: u32,

    /// How long a mutation waits for the writer lock
    pub lock_timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            format_version: FormatVersion::V1,
            sector_size_shift: 3, // 4 KiB sectors
            compression: CompressionMask::ZLIB,
            hash_table_entries: 0x400,
            block_table_entries: 0x400,
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl ArchiveConfig {
    /// Sector size in bytes
    pub fn sector_size(&self) -> usize {
        crate::calculate_sector_size(self.sector_size_shift)
    }

    /// Load configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse `key=value` lines; `#` starts a comment and unknown keys are
    /// ignored
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config = Self::default();

        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::config(format!(
                    "line {}: expected key=value, got {:?}",
                    number + 1,
                    line
                )));
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "format_version" => {
                    config.format_version = FormatVersion::from_raw(parse_number(key, value)?)?;
                }
                "sector_size_shift" => {
                    let shift: u16 = parse_number(key, value)?;
                    if shift > 23 {
                        return Err(Error::config(format!("sector_size_shift {} is too large", shift)));
                    }
                    config.sector_size_shift = shift;
                }
                "compression" => {
                    let bits: u8 = parse_number(key, value)?;
                    config.compression = CompressionMask::from_bits(bits).ok_or_else(|| {
                        Error::config(format!("unknown compression mask {:#04x}", bits))
                    })?;
                }
                "hash_table_entries" => {
                    config.hash_table_entries = parse_number(key, value)?;
                }
                "block_table_entries" => {
                    config.block_table_entries = parse_number(key, value)?;
                }
                "lock_timeout_ms" => {
                    config.lock_timeout = Duration::from_millis(parse_number(key, value)?);
                }
                _ => {
                    log::debug!("ignoring unknown configuration key {:?}", key);
                }
            }
        }

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = fs::File::create(path)?;

        writeln!(file, "# mpqkit configuration")?;
        writeln!(file, "format_version={}", self.format_version as u16)?;
        writeln!(file, "sector_size_shift={}", self.sector_size_shift)?;
        writeln!(file, "compression={:#04x}", self.compression.bits())?;
        writeln!(file, "hash_table_entries={:#x}", self.hash_table_entries)?;
        writeln!(file, "block_table_entries={:#x}", self.block_table_entries)?;
        writeln!(file, "lock_timeout_ms={}", self.lock_timeout.as_millis())?;

        Ok(())
    }
}

/// Decimal or `0x`-prefixed hexadecimal
fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: TryFrom<u64>,
{
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    }
    .map_err(|e| Error::config(format!("{}: invalid number {:?}: {}", key, value, e)))?;

    T::try_from(parsed).map_err(|_| Error::config(format!("{}: {} is out of range", key, value)))
}

/// How an archive is opened
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Allow mutations
    pub write: bool,
    /// Defaults for files added through this handle
    pub config: ArchiveConfig,
}

impl OpenOptions {
    /// Read-only options with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow or forbid mutations
    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Use a specific configuration
    pub fn config(mut self, config: ArchiveConfig) -> Self {
        self.config = config;
        self
    }
}
