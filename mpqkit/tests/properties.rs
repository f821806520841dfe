//! Property tests for the cipher, sector codec, hash index and special files

use mpqkit::compression::CompressionMask;
use mpqkit::crypto::{decrypt_block, encrypt_block, hash_string, HashType, ENCRYPTION_TABLE};
use mpqkit::sector::{decode_file, encode_file, SectorLayout};
use mpqkit::special_files::{filetime_to_posix, posix_to_filetime, split_entries};
use mpqkit::tables::{HashTable, ProbeKey};
use mpqkit::{BlockFlags, Error};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const SECTOR_SIZE: usize = 512;

fn storage_flags() -> impl Strategy<Value = BlockFlags> {
    prop_oneof![
        Just(BlockFlags::empty()),
        Just(BlockFlags::COMPRESSED),
        Just(BlockFlags::IMPLODED),
        Just(BlockFlags::COMPRESSED | BlockFlags::SINGLE_UNIT),
        Just(BlockFlags::COMPRESSED | BlockFlags::ENCRYPTED),
        Just(BlockFlags::ENCRYPTED),
    ]
}

fn lossless_mask() -> impl Strategy<Value = CompressionMask> {
    prop_oneof![
        Just(CompressionMask::ZLIB),
        Just(CompressionMask::BZIP2),
        Just(CompressionMask::IMPLODE),
        Just(CompressionMask::HUFFMAN),
        Just(CompressionMask::HUFFMAN | CompressionMask::ZLIB),
    ]
}

fn payload_size() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(0),
        Just(1),
        Just(SECTOR_SIZE - 1),
        Just(SECTOR_SIZE),
        Just(SECTOR_SIZE + 1),
        0usize..4 * SECTOR_SIZE,
    ]
}

proptest! {
    #[test]
    fn prop_cipher_round_trip(words in prop::collection::vec(any::<u32>(), 0..64), key in any::<u32>()) {
        let mut data = words.clone();
        encrypt_block(&mut data, key);
        decrypt_block(&mut data, key);
        prop_assert_eq!(data, words);
    }

    #[test]
    fn prop_sector_codec_round_trip(
        size in payload_size(),
        flags in storage_flags(),
        mask in lossless_mask(),
        seed in any::<u8>(),
        key in any::<u32>(),
    ) {
        let data: Vec<u8> = (0..size).map(|i| ((i / 5) as u8).wrapping_add(seed)).collect();
        let key = flags.contains(BlockFlags::ENCRYPTED).then_some(key);

        let block = encode_file(&data, SECTOR_SIZE, flags, mask, key).unwrap();
        let layout = SectorLayout {
            sector_size: SECTOR_SIZE,
            file_size: data.len(),
            block_size: block.len(),
            flags: flags | BlockFlags::EXISTS,
        };
        prop_assert_eq!(decode_file(&layout, &block, key, 0).unwrap(), data);
    }

    #[test]
    fn prop_filetime_round_trip(seconds in 0i32..=i32::MAX) {
        let filetime = posix_to_filetime(seconds).unwrap();
        prop_assert_eq!(filetime_to_posix(filetime).unwrap(), seconds);
    }

    #[test]
    fn prop_listfile_split_is_idempotent(parts in prop::collection::vec("[a-z\\\\.]{1,8}", 0..10), seps in prop::collection::vec("[;\r\n]{1,3}", 10)) {
        let mut text = String::new();
        for (part, sep) in parts.iter().zip(seps.iter()) {
            text.push_str(part);
            text.push_str(sep);
        }
        let first = split_entries(&text);
        prop_assert_eq!(&first, &parts);
        let rejoined = first.join(";");
        prop_assert_eq!(split_entries(&rejoined), first);
    }
}

#[test]
fn test_crypto_table_regression_pins() {
    assert_eq!(ENCRYPTION_TABLE[0], 0x55C636E2);
    assert_eq!(hash_string("(hash table)", HashType::FileKey), 0xC3AF3770);
    assert_eq!(hash_string("(block table)", HashType::FileKey), 0xEC83B3A3);
}

#[test]
fn test_hash_probe_survives_deleting_every_other() {
    let mut table = HashTable::new(64).unwrap();
    let names: Vec<String> = (0..48).map(|i| format!("data\\file{:03}.bin", i)).collect();

    let slots: Vec<usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| table.insert(&ProbeKey::new(name, 0, 0), i as u32).unwrap())
        .collect();

    for slot in slots.iter().step_by(2) {
        table.remove(*slot).unwrap();
    }

    for (i, name) in names.iter().enumerate() {
        let found = table.find(&ProbeKey::new(name, 0, 0));
        if i % 2 == 0 {
            assert_eq!(found, None, "{}", name);
        } else {
            let index = found.unwrap_or_else(|| panic!("{} lost after deletions", name));
            assert_eq!(table.get(index).unwrap().block_index, i as u32);
        }
    }

    // Freed slots are reused without breaking the survivors
    table.insert(&ProbeKey::new("data\\late.bin", 0, 0), 99).unwrap();
    assert!(table.find(&ProbeKey::new("data\\file001.bin", 0, 0)).is_some());
}

#[test]
fn test_listfile_mixed_separators() {
    assert_eq!(split_entries("a;b\r\nc\rd\n;e"), vec!["a", "b", "c", "d", "e"]);
}

#[test]
fn test_filetime_out_of_range() {
    assert!(matches!(filetime_to_posix(0), Err(Error::TimeOutOfRange(_))));
    let past_2038 = posix_to_filetime(i32::MAX).unwrap() + 10_000_000;
    assert!(matches!(filetime_to_posix(past_2038), Err(Error::TimeOutOfRange(_))));
    assert!(matches!(posix_to_filetime(-1), Err(Error::TimeOutOfRange(_))));
}
