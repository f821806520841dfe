//! The open-addressing hash index

use super::codec::{check_entry_count, TABLE_ENTRY_SIZE};
use crate::crypto::{hash_string, HashKey, HashType};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Hash table entry (16 bytes on disk)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HashEntry {
    /// `NameA` hash of the path
    pub name_a: u32,
    /// `NameB` hash of the path
    pub name_b: u32,
    /// Windows LANGID of the file
    pub locale: u16,
    /// Platform code of the file
    pub platform: u16,
    /// Block table index or one of the sentinels
    pub block_index: u32,
}

impl HashEntry {
    /// Slot was never used; terminates a probe
    pub const EMPTY: u32 = 0xFFFF_FFFF;
    /// Slot was used and released; a probe continues past it
    pub const DELETED: u32 = 0xFFFF_FFFE;

    /// An empty slot (all bits set, as stored on disk)
    pub fn empty() -> Self {
        Self {
            name_a: 0xFFFF_FFFF,
            name_b: 0xFFFF_FFFF,
            locale: 0xFFFF,
            platform: 0xFFFF,
            block_index: Self::EMPTY,
        }
    }

    /// A deleted slot
    pub fn deleted() -> Self {
        Self {
            block_index: Self::DELETED,
            ..Self::empty()
        }
    }

    /// Never used
    pub fn is_empty(&self) -> bool {
        self.block_index == Self::EMPTY
    }

    /// Released
    pub fn is_deleted(&self) -> bool {
        self.block_index == Self::DELETED
    }

    /// Points at a block
    pub fn is_used(&self) -> bool {
        self.block_index < Self::DELETED
    }

    /// The compound key stored in this slot
    pub fn key(&self) -> HashKey {
        HashKey {
            name_a: self.name_a,
            name_b: self.name_b,
            locale: self.locale,
            platform: self.platform,
        }
    }

    fn matches(&self, key: &HashKey) -> bool {
        self.name_a == key.name_a
            && self.name_b == key.name_b
            && self.locale == key.locale
            && self.platform == key.platform
    }
}

/// Where a path probe starts and what it compares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeKey {
    /// `TableOffset` hash of the path
    pub start: u32,
    /// Compound key to match
    pub key: HashKey,
}

impl ProbeKey {
    /// Hash a path for lookup
    pub fn new(path: &str, locale: u16, platform: u16) -> Self {
        Self {
            start: hash_string(path, HashType::TableOffset),
            key: HashKey::new(path, locale, platform),
        }
    }

    /// Same path with another locale
    pub fn with_locale(self, locale: u16) -> Self {
        Self {
            start: self.start,
            key: self.key.with_locale(locale),
        }
    }
}

/// Hash table: a flat arena of slots addressed by index
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HashTable {
    entries: Vec<HashEntry>,
}

impl HashTable {
    /// An all-empty table of `size` slots
    pub fn new(size: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_format("hash table needs at least one slot"));
        }
        check_entry_count("hash", size, None)?;
        Ok(Self {
            entries: vec![HashEntry::empty(); size as usize],
        })
    }

    /// Parse decrypted table bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() % TABLE_ENTRY_SIZE != 0 {
            return Err(Error::table_mismatch(
                "hash",
                format!("{} bytes is not a whole number of entries", data.len()),
            ));
        }

        let mut cursor = Cursor::new(data);
        let mut entries = Vec::with_capacity(data.len() / TABLE_ENTRY_SIZE);
        for _ in 0..data.len() / TABLE_ENTRY_SIZE {
            entries.push(HashEntry {
                name_a: cursor.read_u32::<LittleEndian>()?,
                name_b: cursor.read_u32::<LittleEndian>()?,
                locale: cursor.read_u16::<LittleEndian>()?,
                platform: cursor.read_u16::<LittleEndian>()?,
                block_index: cursor.read_u32::<LittleEndian>()?,
            });
        }

        Ok(Self { entries })
    }

    /// Serialize to plain (unencrypted) bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * TABLE_ENTRY_SIZE);
        for entry in &self.entries {
            // Writes into a Vec cannot fail
            let _ = buf.write_u32::<LittleEndian>(entry.name_a);
            let _ = buf.write_u32::<LittleEndian>(entry.name_b);
            let _ = buf.write_u16::<LittleEndian>(entry.locale);
            let _ = buf.write_u16::<LittleEndian>(entry.platform);
            let _ = buf.write_u32::<LittleEndian>(entry.block_index);
        }
        buf
    }

    /// Check that every used slot points inside the block table
    pub fn validate(&self, block_count: u32) -> Result<()> {
        for (index, entry) in self.iter_used() {
            if entry.block_index >= block_count {
                return Err(Error::table_mismatch(
                    "hash",
                    format!(
                        "slot {} references block {} of {}",
                        index, entry.block_index, block_count
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// All slots
    pub fn entries(&self) -> &[HashEntry] {
        &self.entries
    }

    /// One slot
    pub fn get(&self, index: usize) -> Option<&HashEntry> {
        self.entries.get(index)
    }

    /// Used slots with their indices
    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &HashEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_used())
    }

    /// Slot indices in probe order, starting at `start mod size`
    fn probe_order(&self, start: u32) -> impl Iterator<Item = usize> {
        let size = self.entries.len();
        let first = start as usize % size;
        (0..size).map(move |step| (first + step) % size)
    }

    /// Probe for an exact key; stops at the first empty slot
    pub fn find(&self, probe: &ProbeKey) -> Option<usize> {
        for index in self.probe_order(probe.start) {
            let entry = &self.entries[index];
            if entry.is_empty() {
                return None;
            }
            if entry.is_used() && entry.matches(&probe.key) {
                return Some(index);
            }
        }
        None
    }

    /// Find a slot by its compound key alone, scanning every slot
    pub fn find_by_key(&self, key: &HashKey) -> Option<usize> {
        self.iter_used()
            .find(|(_, entry)| entry.matches(key))
            .map(|(index, _)| index)
    }

    /// Store `block_index` under `probe`, in the first empty or deleted
    /// slot of its probe path
    pub fn insert(&mut self, probe: &ProbeKey, block_index: u32) -> Result<usize> {
        if block_index >= HashEntry::DELETED {
            return Err(Error::invalid_format("block index collides with a sentinel"));
        }

        let mut free = None;
        for index in self.probe_order(probe.start) {
            let entry = &self.entries[index];
            if entry.is_used() {
                if entry.matches(&probe.key) {
                    return Err(Error::FileExists(format!(
                        "{:08X}:{:08X} locale {:#06x}",
                        probe.key.name_a, probe.key.name_b, probe.key.locale
                    )));
                }
                continue;
            }
            if free.is_none() {
                free = Some(index);
            }
            if entry.is_empty() {
                break;
            }
        }

        let index = free.ok_or(Error::NoFreeHashOrBlockSlot("hash"))?;
        self.entries[index] = HashEntry {
            name_a: probe.key.name_a,
            name_b: probe.key.name_b,
            locale: probe.key.locale,
            platform: probe.key.platform,
            block_index,
        };
        Ok(index)
    }

    /// Release a slot
    ///
    /// The slot becomes empty when the next slot in probe order is empty,
    /// and deleted otherwise so later probes keep walking past it.
    pub fn remove(&mut self, index: usize) -> Result<HashEntry> {
        let size = self.entries.len();
        let entry = *self
            .entries
            .get(index)
            .ok_or_else(|| Error::invalid_format(format!("hash slot {} out of range", index)))?;
        if !entry.is_used() {
            return Err(Error::invalid_format(format!("hash slot {} is not in use", index)));
        }

        let next_is_empty = size == 1 || self.entries[(index + 1) % size].is_empty();
        self.entries[index] = if next_is_empty {
            HashEntry::empty()
        } else {
            HashEntry::deleted()
        };
        Ok(entry)
    }

    /// Used slots referencing `block_index`
    pub fn slots_for_block(&self, block_index: u32) -> Vec<usize> {
        self.iter_used()
            .filter(|(_, entry)| entry.block_index == block_index)
            .map(|(index, _)| index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn probe_at(start: u32, name: u32) -> ProbeKey {
        ProbeKey {
            start,
            key: HashKey {
                name_a: name,
                name_b: !name,
                locale: 0,
                platform: 0,
            },
        }
    }

    #[test]
    fn test_empty_slot_bytes() {
        let table = HashTable::new(2).unwrap();
        assert_eq!(table.to_bytes(), vec![0xFF; 32]);
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut table = HashTable::new(4).unwrap();
        table.insert(&ProbeKey::new("a.txt", 0, 0), 0).unwrap();
        table.insert(&ProbeKey::new("b.txt", 0x409, 0), 1).unwrap();

        let parsed = HashTable::from_bytes(&table.to_bytes()).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn test_lookup_by_path() {
        let mut table = HashTable::new(16).unwrap();
        let probe = ProbeKey::new("war3map.j", 0, 0);
        let index = table.insert(&probe, 3).unwrap();

        assert_eq!(table.find(&probe), Some(index));
        assert_eq!(table.find(&ProbeKey::new("WAR3MAP.J", 0, 0)), Some(index));
        assert_eq!(table.find(&ProbeKey::new("war3map.j", 0x409, 0)), None);
        assert_eq!(table.find(&ProbeKey::new("other", 0, 0)), None);
        assert_eq!(table.find_by_key(&probe.key), Some(index));
    }

    #[test]
    fn test_collisions_probe_linearly_and_wrap() {
        let mut table = HashTable::new(4).unwrap();
        assert_eq!(table.insert(&probe_at(3, 1), 0).unwrap(), 3);
        assert_eq!(table.insert(&probe_at(3, 2), 1).unwrap(), 0);
        assert_eq!(table.insert(&probe_at(7, 3), 2).unwrap(), 1);

        assert_eq!(table.find(&probe_at(3, 2)), Some(0));
        assert_eq!(table.find(&probe_at(7, 3)), Some(1));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = HashTable::new(4).unwrap();
        table.insert(&probe_at(0, 1), 0).unwrap();
        assert!(matches!(
            table.insert(&probe_at(0, 1), 1),
            Err(Error::FileExists(_))
        ));
    }

    #[test]
    fn test_full_table() {
        let mut table = HashTable::new(2).unwrap();
        table.insert(&probe_at(0, 1), 0).unwrap();
        table.insert(&probe_at(0, 2), 1).unwrap();
        assert!(matches!(
            table.insert(&probe_at(0, 3), 2),
            Err(Error::NoFreeHashOrBlockSlot("hash"))
        ));
    }

    #[test]
    fn test_remove_marks_deleted_when_chain_continues() {
        let mut table = HashTable::new(8).unwrap();
        table.insert(&probe_at(2, 1), 0).unwrap();
        table.insert(&probe_at(2, 2), 1).unwrap();

        table.remove(2).unwrap();
        assert!(table.get(2).unwrap().is_deleted());
        assert_eq!(table.find(&probe_at(2, 2)), Some(3));
    }

    #[test]
    fn test_remove_marks_empty_at_chain_end() {
        let mut table = HashTable::new(8).unwrap();
        table.insert(&probe_at(2, 1), 0).unwrap();
        table.insert(&probe_at(2, 2), 1).unwrap();

        table.remove(3).unwrap();
        assert!(table.get(3).unwrap().is_empty());
        assert_eq!(table.find(&probe_at(2, 1)), Some(2));
    }

    #[test]
    fn test_insert_reuses_deleted_slot() {
        let mut table = HashTable::new(8).unwrap();
        table.insert(&probe_at(2, 1), 0).unwrap();
        table.insert(&probe_at(2, 2), 1).unwrap();
        table.remove(2).unwrap();

        // duplicates behind a deleted slot are still detected
        assert!(table.insert(&probe_at(2, 2), 3).is_err());
        assert_eq!(table.insert(&probe_at(2, 3), 2).unwrap(), 2);
    }

    #[test]
    fn test_interleaved_delete_keeps_survivors() {
        let mut table = HashTable::new(64).unwrap();
        let names: Vec<String> = (0..40).map(|i| format!("dir\\file{}.dat", i)).collect();
        let mut slots = Vec::new();
        for (i, name) in names.iter().enumerate() {
            slots.push(table.insert(&ProbeKey::new(name, 0, 0), i as u32).unwrap());
        }

        for slot in slots.iter().step_by(2) {
            table.remove(*slot).unwrap();
        }

        for (i, name) in names.iter().enumerate() {
            let found = table.find(&ProbeKey::new(name, 0, 0));
            if i % 2 == 0 {
                assert_eq!(found, None);
            } else {
                assert_eq!(found, Some(slots[i]));
            }
        }
    }

    #[test]
    fn test_validate_block_references() {
        let mut table = HashTable::new(4).unwrap();
        table.insert(&probe_at(0, 1), 5).unwrap();
        assert!(table.validate(6).is_ok());
        assert!(matches!(
            table.validate(5),
            Err(Error::TableDecryptMismatch { .. })
        ));
    }

    #[test]
    fn test_from_bytes_rejects_partial_entries() {
        assert!(HashTable::from_bytes(&[0u8; 20]).is_err());
        assert!(HashTable::from_bytes(&[]).is_err());
    }
}
