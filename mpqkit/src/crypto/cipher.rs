//! Key table generation and the MPQ stream cipher

use once_cell::sync::Lazy;

/// The process-wide key table shared by hashing and encryption
pub static ENCRYPTION_TABLE: Lazy<[u32; 0x500]> = Lazy::new(generate_encryption_table);

/// Seed of the rolling cipher state
const CIPHER_SEED: u32 = 0xEEEEEEEE;

/// Build the 0x500-entry key table
///
/// Each of the 256 base indices is filled five times with a stride of
/// 0x100; every entry concatenates two 16-bit outputs of the generator.
fn generate_encryption_table() -> [u32; 0x500] {
    let mut table = [0u32; 0x500];
    let mut seed: u32 = 0x00100001;

    for index1 in 0..0x100 {
        for index2 in 0..5 {
            let table_index = index1 + index2 * 0x100;

            seed = (seed.wrapping_mul(125) + 3) % 0x2AAAAB;
            let high = (seed & 0xFFFF) << 0x10;

            seed = (seed.wrapping_mul(125) + 3) % 0x2AAAAB;
            let low = seed & 0xFFFF;

            table[table_index] = high | low;
        }
    }

    table
}

#[inline]
fn next_key(key: u32) -> u32 {
    ((!key) << 0x15).wrapping_add(0x11111111) | (key >> 0x0B)
}

#[inline]
fn next_seed(seed: u32, plain: u32) -> u32 {
    plain
        .wrapping_add(seed)
        .wrapping_add(seed << 5)
        .wrapping_add(3)
}

/// Encrypt a sequence of words in place
pub fn encrypt_block(data: &mut [u32], mut key: u32) {
    let mut seed = CIPHER_SEED;

    for value in data.iter_mut() {
        seed = seed.wrapping_add(ENCRYPTION_TABLE[0x400 + (key & 0xFF) as usize]);

        let plain = *value;
        *value = plain ^ key.wrapping_add(seed);

        key = next_key(key);
        seed = next_seed(seed, plain);
    }
}

/// Decrypt a sequence of words in place
pub fn decrypt_block(data: &mut [u32], mut key: u32) {
    let mut seed = CIPHER_SEED;

    for value in data.iter_mut() {
        seed = seed.wrapping_add(ENCRYPTION_TABLE[0x400 + (key & 0xFF) as usize]);

        let plain = *value ^ key.wrapping_add(seed);
        *value = plain;

        key = next_key(key);
        seed = next_seed(seed, plain);
    }
}

/// Encrypt a byte buffer in place.
///
/// Bytes are taken as little-endian words; a trailing partial word is
/// left untouched.
pub fn encrypt_bytes(data: &mut [u8], key: u32) {
    let mut words = bytes_to_words(data);
    encrypt_block(&mut words, key);
    words_to_bytes(&words, data);
}

/// Decrypt a byte buffer in place. See [`encrypt_bytes`].
pub fn decrypt_bytes(data: &mut [u8], key: u32) {
    let mut words = bytes_to_words(data);
    decrypt_block(&mut words, key);
    words_to_bytes(&words, data);
}

fn bytes_to_words(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn words_to_bytes(words: &[u32], data: &mut [u8]) {
    for (chunk, word) in data.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_table_generation() {
        assert_eq!(ENCRYPTION_TABLE[0x000], 0x55C636E2);
        assert_eq!(ENCRYPTION_TABLE[0x001], 0x02BE0170);
        assert_eq!(ENCRYPTION_TABLE[0x002], 0x584B71D4);
        assert_eq!(ENCRYPTION_TABLE[0x003], 0x2984F00E);
        assert_eq!(ENCRYPTION_TABLE[0x004], 0xB682C809);

        assert_eq!(ENCRYPTION_TABLE[0x100], 0x76F8C1B1);
        assert_eq!(ENCRYPTION_TABLE[0x200], 0x3DF6965D);
        assert_eq!(ENCRYPTION_TABLE[0x300], 0x15F261D3);
        assert_eq!(ENCRYPTION_TABLE[0x400], 0x193AA698);
        assert_eq!(ENCRYPTION_TABLE[0x4FF], 0x7303286C);
    }

    #[test]
    fn test_known_encryption() {
        let mut data = vec![0x12345678, 0x9ABCDEF0, 0x13579BDF, 0x2468ACE0];
        encrypt_block(&mut data, 0xC3AF3770);
        assert_eq!(data, vec![0x940899B4, 0xE0BDA3A0, 0x475B0B12, 0xA96D0417]);

        decrypt_block(&mut data, 0xC3AF3770);
        assert_eq!(data, vec![0x12345678, 0x9ABCDEF0, 0x13579BDF, 0x2468ACE0]);
    }

    #[test]
    fn test_zero_key_still_transforms() {
        let mut data = vec![0u32, 0u32];
        encrypt_block(&mut data, 0);
        assert_eq!(data, vec![0x08299586, 0x299F8910]);
    }

    #[test]
    fn test_different_keys_produce_different_results() {
        let original = vec![0x12345678, 0x9ABCDEF0];

        let mut data1 = original.clone();
        let mut data2 = original.clone();

        encrypt_block(&mut data1, 0x11111111);
        encrypt_block(&mut data2, 0x22222222);

        assert_ne!(data1, data2);
        assert_ne!(data1, original);
    }

    #[test]
    fn test_byte_buffer_leaves_tail() {
        let original: Vec<u8> = (0u8..11).collect();
        let mut data = original.clone();

        encrypt_bytes(&mut data, 0xDEADBEEF);
        assert_ne!(&data[..8], &original[..8]);
        assert_eq!(&data[8..], &original[8..]);

        decrypt_bytes(&mut data, 0xDEADBEEF);
        assert_eq!(data, original);
    }
}
