//! MPQ archive handling: open, create, look up, read, add and remove files
//!
//! Reads go through `&Archive` and share one file handle behind a mutex.
//! Every mutation takes `&mut self`, holds the advisory writer lock, works
//! on copies of both tables and only swaps them in once the new tables and
//! header are on disk.

use crate::compression::CompressionMask;
use crate::config::{ArchiveConfig, OpenOptions};
use crate::crypto::signature::PublicKey;
use crate::crypto::{block_table_key, file_key, hash_table_key, HashKey};
use crate::error::{ArchiveWarning, Error, Result};
use crate::header::{find_header, MpqHeader, UserDataHeader};
use crate::io::{MpqRead, MpqWrite};
use crate::lock::ArchiveLock;
use crate::sector::{self, Sector, SectorLayout};
use crate::special_files::{
    self, normalize_case, AttributeFlags, Attributes, FileAttributes, Listfile, SignatureStatus,
    StrongSignature, WeakSignature, ATTRIBUTES_NAME, LISTFILE_NAME, SIGNATURE_NAME,
};
use crate::tables::{
    read_table, write_table, BlockEntry, BlockFlags, BlockTable, HashEntry, HashTable, ProbeKey,
    TABLE_ENTRY_SIZE,
};
use crate::FormatVersion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Neutral locale
pub const LOCALE_NEUTRAL: u16 = 0;

/// Default platform
pub const PLATFORM_DEFAULT: u16 = 0;

/// A file stored in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalFile {
    /// Path, when known
    pub path: Option<String>,
    /// Index of the hash slot
    pub hash_index: usize,
    /// The hash slot
    pub hash: HashEntry,
    /// Index of the block
    pub block_index: u32,
    /// The block record
    pub block: BlockEntry,
}

impl LogicalFile {
    /// Attach a path learned elsewhere, e.g. from an external listfile
    pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Decompressed size
    pub fn file_size(&self) -> u32 {
        self.block.file_size
    }

    /// Bytes used on disk
    pub fn block_size(&self) -> u32 {
        self.block.block_size
    }

    /// Storage flags
    pub fn flags(&self) -> BlockFlags {
        self.block.flags
    }

    /// Locale of the hash slot
    pub fn locale(&self) -> u16 {
        self.hash.locale
    }

    /// Whether the data is encrypted
    pub fn is_encrypted(&self) -> bool {
        self.block.flags.contains(BlockFlags::ENCRYPTED)
    }

    /// Decryption key, if the file is encrypted and its path known
    pub fn key(&self) -> Option<u32> {
        if !self.is_encrypted() {
            return None;
        }
        self.path.as_deref().map(|path| {
            file_key(
                path,
                self.block.offset,
                self.block.file_size,
                self.block.flags.contains(BlockFlags::FIX_KEY),
            )
        })
    }
}

/// How `add_file` stores a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFileOptions {
    /// Locale of the new hash slot
    pub locale: u16,
    /// Platform of the new hash slot
    pub platform: u16,
    /// Storage flags; `EXISTS` is added automatically
    pub flags: BlockFlags,
    /// Codecs for compressed files; `None` uses the archive configuration
    pub compression: Option<CompressionMask>,
    /// Replace an existing file with the same path, locale and platform
    pub replace_existing: bool,
    /// Add the path to an existing `(listfile)`
    pub update_listfile: bool,
}

impl Default for AddFileOptions {
    fn default() -> Self {
        Self {
            locale: LOCALE_NEUTRAL,
            platform: PLATFORM_DEFAULT,
            flags: BlockFlags::COMPRESSED,
            compression: None,
            replace_existing: false,
            update_listfile: true,
        }
    }
}

impl AddFileOptions {
    /// Compressed with the archive's default codecs
    pub fn new() -> Self {
        Self::default()
    }

    /// Store without compression
    pub fn uncompressed(mut self) -> Self {
        self.flags.remove(BlockFlags::COMPRESSED | BlockFlags::IMPLODED);
        self
    }

    /// Compress every sector with `mask`
    pub fn compression(mut self, mask: CompressionMask) -> Self {
        self.flags.remove(BlockFlags::IMPLODED);
        self.flags.insert(BlockFlags::COMPRESSED);
        self.compression = Some(mask);
        self
    }

    /// Implode sectors without a mask byte
    pub fn imploded(mut self) -> Self {
        self.flags.remove(BlockFlags::COMPRESSED);
        self.flags.insert(BlockFlags::IMPLODED);
        self
    }

    /// Encrypt, optionally binding the key to the block position
    pub fn encrypted(mut self, fix_key: bool) -> Self {
        self.flags.insert(BlockFlags::ENCRYPTED);
        self.flags.set(BlockFlags::FIX_KEY, fix_key);
        self
    }

    /// Store as one sector
    pub fn single_unit(mut self) -> Self {
        self.flags.insert(BlockFlags::SINGLE_UNIT);
        self
    }

    /// Locale of the new entry
    pub fn locale(mut self, locale: u16) -> Self {
        self.locale = locale;
        self
    }

    /// Platform of the new entry
    pub fn platform(mut self, platform: u16) -> Self {
        self.platform = platform;
        self
    }

    /// Replace an existing entry instead of failing
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    /// Keep an existing listfile in sync
    pub fn update_listfile(mut self, update: bool) -> Self {
        self.update_listfile = update;
        self
    }

    /// Flags actually written: conflicting or read-only bits dropped
    fn effective_flags(&self) -> BlockFlags {
        let mut flags = self.flags
            & (BlockFlags::IMPLODED
                | BlockFlags::COMPRESSED
                | BlockFlags::ENCRYPTED
                | BlockFlags::FIX_KEY
                | BlockFlags::SINGLE_UNIT);
        if flags.contains(BlockFlags::COMPRESSED) {
            flags.remove(BlockFlags::IMPLODED);
        }
        if !flags.contains(BlockFlags::ENCRYPTED) {
            flags.remove(BlockFlags::FIX_KEY);
        }
        flags | BlockFlags::EXISTS
    }
}

/// An open MPQ archive
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    file: Mutex<File>,
    writable: bool,
    config: ArchiveConfig,
    /// Absolute offset of the header; all archive offsets are relative to it
    archive_offset: u64,
    user_data: Option<UserDataHeader>,
    header: MpqHeader,
    hash_table: HashTable,
    block_table: BlockTable,
    strong_signature: Option<StrongSignature>,
    warnings: Vec<ArchiveWarning>,
}

impl Archive {
    /// Open an archive read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, OpenOptions::new())
    }

    /// Open an archive with explicit options
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(options.write)
            .open(&path)?;

        let location = find_header(&mut file)?;
        let archive_offset = location.archive_offset;
        let header = location.header;
        let mut warnings = header.validate();

        let hash_data = read_table(
            &mut file,
            "hash",
            archive_offset + header.hash_table_pos(),
            header.hash_table_entries,
            hash_table_key(),
        )?;
        let hash_table = HashTable::from_bytes(&hash_data)?;

        let block_data = read_table(
            &mut file,
            "block",
            archive_offset + header.block_table_pos(),
            header.block_table_entries,
            block_table_key(),
        )?;
        let hi_block = match header.hi_block_table_pos() {
            Some(pos) => Some(file.read_vec_at(
                archive_offset + pos,
                header.block_table_entries as usize * 2,
            )?),
            None => None,
        };
        let block_table = BlockTable::from_bytes(&block_data, hi_block.as_deref())?;

        hash_table.validate(header.block_table_entries)?;

        let total_len = file.total_len()?;
        for (index, block) in block_table.entries().iter().enumerate() {
            if block.exists() && archive_offset + block.end() > total_len {
                let warning = ArchiveWarning::BlockOutOfBounds {
                    block_index: index as u32,
                };
                log::warn!("tolerating archive inconsistency: {}", warning);
                warnings.push(warning);
            }
        }

        let strong_signature =
            StrongSignature::read_at(&mut file, archive_offset + header.archive_size as u64)?;

        log::debug!(
            "opened {} ({:?}, {} hash slots, {} blocks, sector size {})",
            path.display(),
            header.format_version,
            hash_table.size(),
            block_table.size(),
            header.sector_size()
        );

        Ok(Self {
            path,
            file: Mutex::new(file),
            writable: options.write,
            config: options.config,
            archive_offset,
            user_data: location.user_data,
            header,
            hash_table,
            block_table,
            strong_signature,
            warnings,
        })
    }

    /// Create a new, empty archive and open it for writing
    ///
    /// Table sizes, format version and sector size come from `config`. An
    /// existing file at `path` is replaced.
    pub fn create<P: AsRef<Path>>(path: P, config: ArchiveConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = ArchiveLock::acquire(&path, config.lock_timeout)?;

        let hash_table = HashTable::new(config.hash_table_entries)?;
        let block_table = BlockTable::new(config.block_table_entries)?;
        if !crate::is_power_of_two(config.hash_table_entries) {
            log::warn!(
                "creating archive with {} hash slots, which is not a power of two",
                config.hash_table_entries
            );
        }

        let mut header = MpqHeader::new(config.format_version, config.sector_size_shift);
        header.hash_table_entries = config.hash_table_entries;
        header.block_table_entries = config.block_table_entries;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        // Placeholder header, patched once the table positions are known
        temp.as_file_mut().write_all(&header.to_bytes())?;
        write_tables(temp.as_file_mut(), 0, &mut header, &hash_table, &block_table)?;
        temp.as_file_mut().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        log::debug!(
            "created {} ({:?}, {} hash slots, {} blocks)",
            path.display(),
            config.format_version,
            config.hash_table_entries,
            config.block_table_entries
        );

        drop(lock);
        Self::open_with_options(&path, OpenOptions::new().write(true).config(config))
    }

    /// Flush and close the archive
    pub fn close(self) -> Result<()> {
        let file = self.file.into_inner();
        if self.writable {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Path of the archive file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The archive header
    pub fn header(&self) -> &MpqHeader {
        &self.header
    }

    /// Format version
    pub fn format_version(&self) -> FormatVersion {
        self.header.format_version
    }

    /// Sector size in bytes
    pub fn sector_size(&self) -> usize {
        self.header.sector_size()
    }

    /// Absolute offset of the archive within its file
    pub fn archive_offset(&self) -> u64 {
        self.archive_offset
    }

    /// User data block that preceded the header, if any
    pub fn user_data(&self) -> Option<&UserDataHeader> {
        self.user_data.as_ref()
    }

    /// The hash table
    pub fn hash_table(&self) -> &HashTable {
        &self.hash_table
    }

    /// The block table
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Strong signature found after the archive, if any
    pub fn strong_signature(&self) -> Option<&StrongSignature> {
        self.strong_signature.as_ref()
    }

    /// Inconsistencies tolerated while opening
    pub fn warnings(&self) -> &[ArchiveWarning] {
        &self.warnings
    }

    /// Whether mutations are allowed
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The configuration used for new files
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn logical_file(&self, hash_index: usize, path: Option<String>) -> Option<LogicalFile> {
        let hash = *self.hash_table.get(hash_index)?;
        let block = *self.block_table.get(hash.block_index)?;
        Some(LogicalFile {
            path,
            hash_index,
            hash,
            block_index: hash.block_index,
            block,
        })
    }

    /// Look up a file by path, locale and platform
    pub fn find_file(&self, path: &str, locale: u16, platform: u16) -> Option<LogicalFile> {
        let probe = ProbeKey::new(path, locale, platform);
        let index = self.hash_table.find(&probe)?;
        self.logical_file(index, Some(path.to_string()))
    }

    /// Look up a file by its hash key; the path stays unknown
    pub fn find_file_by_key(&self, key: &HashKey) -> Option<LogicalFile> {
        let index = self.hash_table.find_by_key(key)?;
        self.logical_file(index, None)
    }

    /// Look up a file, falling back to the neutral locale
    pub fn find_file_with_fallback(
        &self,
        path: &str,
        locale: u16,
        platform: u16,
    ) -> Option<LogicalFile> {
        self.find_file(path, locale, platform).or_else(|| {
            if locale == LOCALE_NEUTRAL {
                None
            } else {
                self.find_file(path, LOCALE_NEUTRAL, platform)
            }
        })
    }

    /// Whether a file with the neutral locale exists
    pub fn contains(&self, path: &str) -> bool {
        self.find_file(path, LOCALE_NEUTRAL, PLATFORM_DEFAULT).is_some()
    }

    fn read_block(&self, block: &BlockEntry) -> Result<Vec<u8>> {
        if block.block_size == 0 {
            return Ok(Vec::new());
        }
        let mut file = self.file.lock();
        file.read_vec_at(self.archive_offset + block.position(), block.block_size as usize)
    }

    fn layout(&self, block: &BlockEntry) -> SectorLayout {
        SectorLayout {
            sector_size: self.header.sector_size(),
            file_size: block.file_size as usize,
            block_size: block.block_size as usize,
            flags: block.flags,
        }
    }

    /// Read and decode a file
    pub fn read_file(&self, file: &LogicalFile) -> Result<Vec<u8>> {
        if !file.block.exists() {
            return Err(Error::FileNotFound(format!(
                "block {} holds no file",
                file.block_index
            )));
        }

        let data = self.read_block(&file.block)?;
        sector::decode_file(&self.layout(&file.block), &data, file.key(), file.block_index)
    }

    /// Read a file with the neutral locale by path
    pub fn read_file_by_name(&self, path: &str) -> Result<Vec<u8>> {
        let file = self
            .find_file(path, LOCALE_NEUTRAL, PLATFORM_DEFAULT)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        self.read_file(&file)
    }

    /// On-disk sectors of a file
    pub fn sectors(&self, file: &LogicalFile) -> Result<Vec<Sector>> {
        let layout = self.layout(&file.block);
        let prefix_len = if layout.has_offset_table() {
            (layout.offset_table_entries() * 4).min(file.block.block_size as usize)
        } else {
            0
        };
        let prefix = {
            let mut handle = self.file.lock();
            handle.read_vec_at(self.archive_offset + file.block.position(), prefix_len)?
        };
        layout.sectors(&prefix, file.key(), file.block_index)
    }

    /// Every used hash slot, with paths resolved through the listfile.
    ///
    /// Resolved paths share one casing per directory prefix, the first
    /// one the listfile mentions.
    pub fn files(&self) -> Result<Vec<LogicalFile>> {
        let mut known: HashMap<(u32, u32), String> = HashMap::new();
        let mut names: Vec<String> = [LISTFILE_NAME, ATTRIBUTES_NAME, SIGNATURE_NAME]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match self.listfile() {
            Ok(Some(listfile)) => names.extend(normalize_case(listfile.entries())),
            Ok(None) => {}
            Err(e) => log::warn!("ignoring unreadable (listfile): {}", e),
        }
        for name in names {
            let key = HashKey::new(&name, 0, 0);
            known.entry((key.name_a, key.name_b)).or_insert(name);
        }

        Ok(self
            .hash_table
            .iter_used()
            .filter_map(|(index, entry)| {
                let path = known.get(&(entry.name_a, entry.name_b)).cloned();
                self.logical_file(index, path)
            })
            .collect())
    }

    /// The archive's listfile, if it has one
    pub fn listfile(&self) -> Result<Option<Listfile>> {
        match self.find_file(LISTFILE_NAME, LOCALE_NEUTRAL, PLATFORM_DEFAULT) {
            Some(file) => Ok(Some(Listfile::from_bytes(&self.read_file(&file)?))),
            None => Ok(None),
        }
    }

    /// The archive's attributes, if it has them
    pub fn attributes(&self) -> Result<Option<Attributes>> {
        match self.find_file(ATTRIBUTES_NAME, LOCALE_NEUTRAL, PLATFORM_DEFAULT) {
            Some(file) => {
                let data = self.read_file(&file)?;
                Attributes::parse(&data, self.block_table.size()).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Check a file against its recorded CRC32 and MD5
    ///
    /// Returns `None` when the archive carries no attributes.
    pub fn verify_file_attributes(&self, file: &LogicalFile) -> Result<Option<bool>> {
        let Some(attributes) = self.attributes()? else {
            return Ok(None);
        };
        let Some(expected) = attributes.get(file.block_index) else {
            return Ok(None);
        };
        let data = self.read_file(file)?;
        Ok(Some(expected.matches(&data)))
    }

    /// Verify the archive signature with Blizzard's public keys
    pub fn verify_signature(&self) -> Result<SignatureStatus> {
        self.verify_signature_with(&PublicKey::blizzard_weak()?, &PublicKey::blizzard_strong()?)
    }

    /// Verify the archive signature with explicit public keys
    ///
    /// A strong signature takes precedence over a `(signature)` file.
    pub fn verify_signature_with(
        &self,
        weak_key: &PublicKey,
        strong_key: &PublicKey,
    ) -> Result<SignatureStatus> {
        let archive_range =
            self.archive_offset..self.archive_offset + self.header.archive_size as u64;

        if let Some(strong) = &self.strong_signature {
            let digest = {
                let mut file = self.file.lock();
                special_files::signature::strong_digest(&mut *file, archive_range)?
            };
            return Ok(if strong.verify(strong_key, &digest)? {
                SignatureStatus::StrongValid
            } else {
                SignatureStatus::StrongInvalid
            });
        }

        let Some(file) = self.find_file(SIGNATURE_NAME, LOCALE_NEUTRAL, PLATFORM_DEFAULT) else {
            return Ok(SignatureStatus::Unsigned);
        };
        let signature = WeakSignature::parse(&self.read_file(&file)?)?;
        let block_start = self.archive_offset + file.block.position();
        let block_range = block_start..block_start + file.block.block_size as u64;

        let digest = {
            let mut handle = self.file.lock();
            special_files::signature::weak_digest(&mut *handle, archive_range, block_range)?
        };
        Ok(if signature.verify(weak_key, &digest)? {
            SignatureStatus::WeakValid
        } else {
            SignatureStatus::WeakInvalid
        })
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    fn lock(&self) -> Result<ArchiveLock> {
        ArchiveLock::acquire(&self.path, self.config.lock_timeout)
    }

    /// Add a file
    pub fn add_file(
        &mut self,
        path: &str,
        data: &[u8],
        options: &AddFileOptions,
    ) -> Result<LogicalFile> {
        self.ensure_writable()?;
        let _lock = self.lock()?;

        let added = self.add_file_locked(path, data, options)?;
        if options.update_listfile && !special_files::is_special_file(path) {
            self.sync_listfile(|listfile| listfile.insert(path))?;
        }
        // The listfile rewrite may have moved blocks; report the fresh state
        Ok(self
            .find_file(path, options.locale, options.platform)
            .unwrap_or(added))
    }

    /// Remove a file
    pub fn remove_file(&mut self, path: &str, locale: u16, platform: u16) -> Result<()> {
        self.ensure_writable()?;
        let _lock = self.lock()?;

        let probe = ProbeKey::new(path, locale, platform);
        let index = self
            .hash_table
            .find(&probe)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;

        let mut hash_table = self.hash_table.clone();
        let mut block_table = self.block_table.clone();
        release_slot(&mut hash_table, &mut block_table, index)?;
        self.commit(hash_table, block_table)?;
        log::debug!("removed {} (locale {:#06x})", path, locale);

        // Other locales of the same path keep their listfile entry
        let still_listed = self
            .hash_table
            .iter_used()
            .any(|(_, entry)| entry.name_a == probe.key.name_a && entry.name_b == probe.key.name_b);
        if !still_listed && !special_files::is_special_file(path) {
            self.sync_listfile(|listfile| listfile.remove(path))?;
        }
        Ok(())
    }

    /// Replace `(listfile)` with `entries`
    pub fn write_listfile<I, S>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_writable()?;
        let _lock = self.lock()?;
        let listfile = Listfile::from_entries(entries);
        self.store_special(LISTFILE_NAME, &listfile.to_bytes())?;
        Ok(())
    }

    /// Recompute CRC32, timestamp and MD5 of every readable file and
    /// rewrite `(attributes)`
    pub fn update_attributes(&mut self) -> Result<Attributes> {
        self.ensure_writable()?;
        let _lock = self.lock()?;

        let mut attributes = Attributes::new(AttributeFlags::all(), self.block_table.size());
        for file in self.files()? {
            if file.path.as_deref() == Some(ATTRIBUTES_NAME) || !file.block.exists() {
                continue;
            }
            match self.read_file(&file) {
                Ok(data) => attributes.set(file.block_index, FileAttributes::compute(&data)),
                Err(e) => log::debug!("no attributes for block {}: {}", file.block_index, e),
            }
        }

        self.store_special(ATTRIBUTES_NAME, &attributes.to_bytes())?;
        Ok(attributes)
    }

    /// Rewrite the listfile if the archive has one and `edit` changed it
    fn sync_listfile<F>(&mut self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Listfile) -> bool,
    {
        let Some(mut listfile) = self.listfile()? else {
            return Ok(());
        };
        if edit(&mut listfile) {
            self.store_special(LISTFILE_NAME, &listfile.to_bytes())?;
        }
        Ok(())
    }

    fn store_special(&mut self, name: &str, data: &[u8]) -> Result<LogicalFile> {
        let options = AddFileOptions::new()
            .compression(self.config.compression)
            .replace_existing(true)
            .update_listfile(false);
        self.add_file_locked(name, data, &options)
    }

    fn add_file_locked(
        &mut self,
        path: &str,
        data: &[u8],
        options: &AddFileOptions,
    ) -> Result<LogicalFile> {
        let file_size = u32::try_from(data.len())
            .map_err(|_| Error::invalid_format(format!("{} is larger than 4 GiB", path)))?;

        let mut hash_table = self.hash_table.clone();
        let mut block_table = self.block_table.clone();

        let probe = ProbeKey::new(path, options.locale, options.platform);
        if let Some(existing) = hash_table.find(&probe) {
            if !options.replace_existing {
                return Err(Error::FileExists(path.to_string()));
            }
            release_slot(&mut hash_table, &mut block_table, existing)?;
        }

        let flags = options.effective_flags();
        let mask = options.compression.unwrap_or(self.config.compression);
        let sector_size = self.header.sector_size();
        let base_key = file_key(path, 0, file_size, false);
        let key = flags.contains(BlockFlags::ENCRYPTED).then_some(base_key);

        let mut encoded = sector::encode_file(data, sector_size, flags, mask, key)?;
        let needed = u32::try_from(encoded.len())
            .map_err(|_| Error::invalid_format(format!("{} does not fit one block", path)))?;

        let floor = self.data_floor();
        let data_end = block_table.data_end(floor);
        let (block_index, position) = match block_table.find_empty_fit(needed) {
            Some(index) => {
                block_table.split_empty(index, needed)?;
                (index, block_table.entries()[index as usize].position())
            }
            None => {
                let index = block_table
                    .find_unused()
                    .or_else(|| block_table.find_empty())
                    .ok_or(Error::NoFreeHashOrBlockSlot("block"))?;
                (index, data_end)
            }
        };

        if self.header.format_version == FormatVersion::V1
            && position + needed as u64 > u32::MAX as u64
        {
            return Err(Error::invalid_format("v1 archives cannot grow past 4 GiB"));
        }

        if flags.contains(BlockFlags::FIX_KEY) {
            let key = file_key(path, position as u32, file_size, true);
            encoded = sector::encode_file(data, sector_size, flags, mask, Some(key))?;
        }

        hash_table.insert(&probe, block_index)?;
        let block = block_table
            .get_mut(block_index)
            .ok_or(Error::NoFreeHashOrBlockSlot("block"))?;
        block.set_position(position)?;
        block.block_size = needed;
        block.file_size = file_size;
        block.flags = flags;

        // Everything that can be rejected is checked before the first byte
        // hits the file
        let (header, layout) = self.plan_commit(&hash_table, &block_table)?;
        self.file
            .get_mut()
            .write_at(self.archive_offset + position, &encoded)?;
        self.write_commit(header, layout, hash_table, block_table)?;

        log::debug!(
            "added {} ({} -> {} bytes) as block {} at {:#x}",
            path,
            file_size,
            needed,
            block_index,
            position
        );

        self.find_file(path, options.locale, options.platform)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))
    }

    /// Lowest offset file data may occupy
    fn data_floor(&self) -> u64 {
        self.header
            .header_size
            .max(self.header.format_version.header_size()) as u64
    }

    fn commit(&mut self, hash_table: HashTable, block_table: BlockTable) -> Result<()> {
        let (header, layout) = self.plan_commit(&hash_table, &block_table)?;
        self.write_commit(header, layout, hash_table, block_table)
    }

    /// Header describing `block_table` with the tables placed after the data
    fn plan_commit(
        &self,
        hash_table: &HashTable,
        block_table: &BlockTable,
    ) -> Result<(MpqHeader, TableLayout)> {
        let mut header = self.header.clone();
        header.header_size = header.format_version.header_size();
        let data_end = block_table.data_end(self.data_floor());
        let layout = plan_tables(data_end, &mut header, hash_table, block_table)?;
        Ok((header, layout))
    }

    /// Write the planned tables, patch the header, truncate, then swap the
    /// new tables in
    fn write_commit(
        &mut self,
        header: MpqHeader,
        layout: TableLayout,
        hash_table: HashTable,
        block_table: BlockTable,
    ) -> Result<()> {
        let archive_offset = self.archive_offset;
        let file = self.file.get_mut();
        write_tables_at(file, archive_offset, &layout, &hash_table, &block_table)?;
        file.write_at(archive_offset, &header.to_bytes())?;
        file.set_len(archive_offset + layout.end)?;
        file.flush()?;

        if self.strong_signature.take().is_some() {
            log::warn!("archive modified, strong signature dropped");
        }

        self.header = header;
        self.hash_table = hash_table;
        self.block_table = block_table;
        Ok(())
    }
}

/// Remove a hash slot and free its block unless another slot shares it
fn release_slot(
    hash_table: &mut HashTable,
    block_table: &mut BlockTable,
    index: usize,
) -> Result<()> {
    let removed = hash_table.remove(index)?;
    let block_index = removed.block_index;
    if !hash_table.slots_for_block(block_index).is_empty() {
        return Ok(());
    }

    let last = block_table.is_last_stored(block_index);
    if let Some(block) = block_table.get_mut(block_index) {
        if last {
            block.release();
        } else {
            block.clear();
        }
    }
    if last {
        block_table.trim_trailing_empty();
    }
    Ok(())
}

/// Write the tables of a fresh archive directly after its header
fn write_tables(
    file: &mut File,
    archive_offset: u64,
    header: &mut MpqHeader,
    hash_table: &HashTable,
    block_table: &BlockTable,
) -> Result<()> {
    let start = header.format_version.header_size() as u64;
    let layout = plan_tables(start, header, hash_table, block_table)?;
    write_tables_at(file, archive_offset, &layout, hash_table, block_table)?;
    file.write_at(archive_offset, &header.to_bytes())
}

/// Table positions chosen for a commit, relative to the archive start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableLayout {
    hash_pos: u64,
    block_pos: u64,
    hi_block_pos: Option<u64>,
    /// Archive end, behind the last table
    end: u64,
}

/// Place hash, block and (for v2) hi-block tables from `start` and fill in
/// the matching header fields. Nothing is written, so a layout the header
/// cannot express is rejected while the file is still untouched.
fn plan_tables(
    start: u64,
    header: &mut MpqHeader,
    hash_table: &HashTable,
    block_table: &BlockTable,
) -> Result<TableLayout> {
    let hash_pos = start;
    let block_pos = hash_pos + (hash_table.size() * TABLE_ENTRY_SIZE) as u64;
    let mut end = block_pos + (block_table.size() * TABLE_ENTRY_SIZE) as u64;

    header.set_hash_table_pos(hash_pos)?;
    header.set_block_table_pos(block_pos)?;
    header.hash_table_entries = hash_table.size() as u32;
    header.block_table_entries = block_table.size() as u32;

    let hi_block_pos = match header.format_version {
        FormatVersion::V2 => {
            let pos = end;
            header.hi_block_table_offset = pos;
            end += block_table.size() as u64 * 2;
            Some(pos)
        }
        FormatVersion::V1 if block_table.needs_hi_block() => {
            return Err(Error::invalid_format("v1 archive has a block beyond 4 GiB"));
        }
        FormatVersion::V1 => None,
    };

    header.archive_size = archive_size_field(end)?;
    Ok(TableLayout {
        hash_pos,
        block_pos,
        hi_block_pos,
        end,
    })
}

/// The header stores the archive size in 32 bits
fn archive_size_field(end: u64) -> Result<u32> {
    u32::try_from(end).map_err(|_| {
        Error::invalid_format(format!(
            "archive would end at {:#x}, past the 32-bit archive size field",
            end
        ))
    })
}

/// Write the tables where [`plan_tables`] placed them
fn write_tables_at(
    file: &mut File,
    archive_offset: u64,
    layout: &TableLayout,
    hash_table: &HashTable,
    block_table: &BlockTable,
) -> Result<()> {
    write_table(
        file,
        "hash",
        archive_offset + layout.hash_pos,
        hash_table.to_bytes(),
        hash_table_key(),
    )?;
    write_table(
        file,
        "block",
        archive_offset + layout.block_pos,
        block_table.to_bytes(),
        block_table_key(),
    )?;
    if let Some(pos) = layout.hi_block_pos {
        file.write_at(archive_offset + pos, &block_table.hi_block_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small_config() -> ArchiveConfig {
        ArchiveConfig {
            hash_table_entries: 16,
            block_table_entries: 8,
            sector_size_shift: 0,
            ..ArchiveConfig::default()
        }
    }

    #[test]
    fn test_create_empty_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mpq");
        let archive = Archive::create(&path, small_config()).unwrap();

        let header = archive.header();
        assert_eq!(header.hash_table_pos(), 32);
        assert_eq!(header.block_table_pos(), 32 + 16 * 16);
        assert_eq!(header.archive_size, 32 + 16 * 16 + 8 * 16);
        assert!(archive.warnings().is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), header.archive_size as u64);
        assert!(!ArchiveLock::lock_path(&path).exists());
    }

    #[test]
    fn test_add_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mpq");
        let mut archive = Archive::create(&path, small_config()).unwrap();

        let data = b"hello archive ".repeat(100);
        let file = archive.add_file("dir\\hello.txt", &data, &AddFileOptions::new()).unwrap();
        assert_eq!(file.file_size() as usize, data.len());
        assert!(file.block_size() < file.file_size());
        assert_eq!(archive.read_file_by_name("dir\\hello.txt").unwrap(), data);
        assert_eq!(archive.read_file_by_name("DIR/HELLO.TXT").unwrap(), data);

        archive.remove_file("dir\\hello.txt", 0, 0).unwrap();
        assert!(!archive.contains("dir\\hello.txt"));
        assert!(archive.block_table().entries()[0].is_unused());
        assert_eq!(archive.header().hash_table_pos(), 32);
    }

    #[test]
    fn test_duplicate_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(dir.path().join("d.mpq"), small_config()).unwrap();

        archive.add_file("x", b"one", &AddFileOptions::new()).unwrap();
        assert!(matches!(
            archive.add_file("x", b"two", &AddFileOptions::new()),
            Err(Error::FileExists(_))
        ));
        archive
            .add_file("x", b"three", &AddFileOptions::new().replace_existing(true))
            .unwrap();
        assert_eq!(archive.read_file_by_name("x").unwrap(), b"three");
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.mpq");
        Archive::create(&path, small_config()).unwrap().close().unwrap();

        let mut archive = Archive::open(&path).unwrap();
        assert!(matches!(
            archive.add_file("x", b"1", &AddFileOptions::new()),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(archive.remove_file("x", 0, 0), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_effective_flags() {
        let options = AddFileOptions::new().imploded().compression(CompressionMask::ZLIB);
        assert_eq!(
            options.effective_flags(),
            BlockFlags::COMPRESSED | BlockFlags::EXISTS
        );

        let mut options = AddFileOptions::new().uncompressed();
        options.flags |= BlockFlags::FIX_KEY | BlockFlags::SECTOR_CRC;
        assert_eq!(options.effective_flags(), BlockFlags::EXISTS);
    }

    #[test]
    fn test_rejected_commit_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.mpq");
        let mut archive = Archive::create(&path, small_config()).unwrap();
        let before = std::fs::read(&path).unwrap();

        // data fits below 4 GiB but the tables behind it would not
        let block = archive.block_table.get_mut(0).unwrap();
        block.set_position(u32::MAX as u64 - 0x100).unwrap();
        block.block_size = 0x10;
        block.file_size = 0x10;
        block.flags = BlockFlags::EXISTS;

        let result = archive.add_file("late.txt", &[7u8; 16], &AddFileOptions::new().uncompressed());
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(!archive.contains("late.txt"));
    }

    #[test]
    fn test_archive_size_must_fit_header() {
        assert_eq!(archive_size_field(0xFFFF_FFFF).unwrap(), u32::MAX);
        assert!(archive_size_field(0x1_0000_0000).is_err());

        // v2 offsets may pass 4 GiB, the size field may not
        let mut header = MpqHeader::new(FormatVersion::V2, 3);
        let hash_table = HashTable::new(16).unwrap();
        let block_table = BlockTable::new(8).unwrap();
        assert!(plan_tables(0xFFFF_FF00, &mut header, &hash_table, &block_table).is_err());

        let layout = plan_tables(0x1000, &mut header, &hash_table, &block_table).unwrap();
        assert_eq!(layout.hi_block_pos, Some(0x1000 + 24 * 16));
        assert_eq!(layout.end, 0x1000 + 24 * 16 + 16);
        assert_eq!(header.archive_size as u64, layout.end);
    }

    #[test]
    fn test_reused_gap_keeps_its_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gap.mpq");
        let mut archive = Archive::create(&path, small_config()).unwrap();
        let stored = AddFileOptions::new().uncompressed();

        let first = archive.add_file("first.bin", &[1u8; 1000], &stored).unwrap();
        archive.add_file("second.bin", &[2u8; 10], &stored).unwrap();
        archive.remove_file("first.bin", 0, 0).unwrap();

        let small = archive.add_file("small.bin", &[3u8; 100], &stored).unwrap();
        assert_eq!(small.block.position(), first.block.position());
        assert_eq!(small.block_size(), 100);

        let len = std::fs::metadata(&path).unwrap().len();
        let rest = archive.add_file("rest.bin", &[4u8; 900], &stored).unwrap();
        assert_eq!(rest.block.position(), first.block.position() + 100);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
        assert_eq!(archive.read_file_by_name("small.bin").unwrap(), vec![3u8; 100]);
        assert_eq!(archive.read_file_by_name("rest.bin").unwrap(), vec![4u8; 900]);
    }
}
