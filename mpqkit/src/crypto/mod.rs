//! Cryptographic operations for MPQ archives

pub mod cipher;
pub mod hash;
pub mod signature;

pub use cipher::{
    decrypt_block, decrypt_bytes, encrypt_block, encrypt_bytes, ENCRYPTION_TABLE,
};
pub use hash::{file_key, hash_string, normalize_path, plain_name, HashKey, HashType};

/// Key of the encrypted hash table
pub fn hash_table_key() -> u32 {
    hash_string("(hash table)", HashType::FileKey)
}

/// Key of the encrypted block table
pub fn block_table_key() -> u32 {
    hash_string("(block table)", HashType::FileKey)
}
