//! String hashing and file key derivation

use super::cipher::ENCRYPTION_TABLE;

/// The four hash flavours used by the archive format
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    /// Start index of the hash table probe
    TableOffset = 0,
    /// First half of the compound path key
    NameA = 1,
    /// Second half of the compound path key
    NameB = 2,
    /// Seed of table and sector encryption keys
    FileKey = 3,
}

/// ASCII uppercase conversion table, with '/' folded into '\'
const NORMALIZE_CHAR: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }
    let mut i = b'a';
    while i <= b'z' {
        table[i as usize] = i - 32;
        i += 1;
    }
    table[b'/' as usize] = b'\\';
    table
};

/// Hash a path or table name
///
/// Hashing is case-insensitive and treats '/' and '\' as the same separator.
pub fn hash_string(text: &str, hash_type: HashType) -> u32 {
    hash_bytes(text.as_bytes(), hash_type)
}

/// Hash raw bytes, see [`hash_string`]
pub fn hash_bytes(text: &[u8], hash_type: HashType) -> u32 {
    let table = &*ENCRYPTION_TABLE;
    let base = (hash_type as usize) << 8;

    let mut seed1: u32 = 0x7FED7FED;
    let mut seed2: u32 = 0xEEEEEEEE;

    for &byte in text {
        let ch = NORMALIZE_CHAR[byte as usize] as u32;

        seed1 = table[base + ch as usize] ^ seed1.wrapping_add(seed2);
        seed2 = ch
            .wrapping_add(seed1)
            .wrapping_add(seed2)
            .wrapping_add(seed2 << 5)
            .wrapping_add(3);
    }

    seed1
}

/// The compound key identifying a hash slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HashKey {
    /// `NameA` hash of the path
    pub name_a: u32,
    /// `NameB` hash of the path
    pub name_b: u32,
    /// Windows LANGID, 0 for neutral
    pub locale: u16,
    /// Platform code, 0 for all platforms
    pub platform: u16,
}

impl HashKey {
    /// Build the lookup key of a path
    pub fn new(path: &str, locale: u16, platform: u16) -> Self {
        Self {
            name_a: hash_string(path, HashType::NameA),
            name_b: hash_string(path, HashType::NameB),
            locale,
            platform,
        }
    }

    /// Same path hashes with a different locale
    pub fn with_locale(self, locale: u16) -> Self {
        Self { locale, ..self }
    }
}

/// The part of a path after its last separator
pub fn plain_name(path: &str) -> &str {
    match path.rfind(['\\', '/']) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Derive the encryption key of a stored file
///
/// With `fix_key` the key is bound to the block position and file size,
/// so a relocated block has to be re-encrypted.
pub fn file_key(path: &str, block_offset: u32, file_size: u32, fix_key: bool) -> u32 {
    let key = hash_string(plain_name(path), HashType::FileKey);
    if fix_key {
        key.wrapping_add(block_offset) ^ file_size
    } else {
        key
    }
}

/// Normalize a path to the archive's separator convention
pub fn normalize_path(path: &str) -> String {
    path.replace('/', "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_keys() {
        assert_eq!(hash_string("(hash table)", HashType::FileKey), 0xC3AF3770);
        assert_eq!(hash_string("(block table)", HashType::FileKey), 0xEC83B3A3);
    }

    #[test]
    fn test_known_path_hashes() {
        assert_eq!(hash_string("test.txt", HashType::TableOffset), 0x6B022F7B);
        assert_eq!(hash_string("test.txt", HashType::NameA), 0x7D9AA20D);
        assert_eq!(hash_string("test.txt", HashType::NameB), 0x9FEE7CA0);
        assert_eq!(hash_string("(listfile)", HashType::NameA), 0xFD657910);
        assert_eq!(hash_string("(listfile)", HashType::NameB), 0x4E9B98A7);
    }

    #[test]
    fn test_case_and_separator_insensitive() {
        let a = hash_string("Units\\Human\\Footman.mdx", HashType::NameA);
        let b = hash_string("UNITS/human/footman.MDX", HashType::NameA);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_types_differ() {
        let values: Vec<u32> = [
            HashType::TableOffset,
            HashType::NameA,
            HashType::NameB,
            HashType::FileKey,
        ]
        .iter()
        .map(|&t| hash_string("war3map.j", t))
        .collect();

        for i in 0..values.len() {
            for j in i + 1..values.len() {
                assert_ne!(values[i], values[j]);
            }
        }
    }

    #[test]
    fn test_plain_name() {
        assert_eq!(plain_name("a\\b\\c.txt"), "c.txt");
        assert_eq!(plain_name("a/b/c.txt"), "c.txt");
        assert_eq!(plain_name("c.txt"), "c.txt");
        assert_eq!(plain_name("dir\\"), "");
    }

    #[test]
    fn test_file_key() {
        let base = hash_string("test.txt", HashType::FileKey);
        assert_eq!(base, 0x82C45239);
        assert_eq!(file_key("dir\\test.txt", 0x20, 5, false), base);
        assert_eq!(
            file_key("dir\\test.txt", 0x20, 5, true),
            base.wrapping_add(0x20) ^ 5
        );
    }

    #[test]
    fn test_hash_key() {
        let key = HashKey::new("test.txt", 0x409, 0);
        assert_eq!(key.name_a, 0x7D9AA20D);
        assert_eq!(key.name_b, 0x9FEE7CA0);
        assert_eq!(key.with_locale(0).locale, 0);
    }
}
