//! Reading and writing the bulk-encrypted tables
//!
//! Both tables are encrypted as one contiguous buffer, so any change means
//! re-encrypting and rewriting the whole table.

use crate::crypto::{decrypt_bytes, encrypt_bytes};
use crate::{Error, Result};
use std::io::{Read, Seek, SeekFrom, Write};

/// On-disk size of one hash or block table entry
pub const TABLE_ENTRY_SIZE: usize = 16;

/// Entry counts from this value on collide with the slot sentinels
pub const MAX_TABLE_ENTRIES: u32 = 0xFFFF_FFFE;

/// Reject entry counts that cannot be represented or stored
pub fn check_entry_count(table: &'static str, entries: u32, available: Option<u64>) -> Result<()> {
    let bytes = entries as u64 * TABLE_ENTRY_SIZE as u64;
    let too_large = entries >= MAX_TABLE_ENTRIES || available.is_some_and(|avail| bytes > avail);
    if too_large {
        return Err(Error::TableTooLarge {
            table,
            entries: entries as u64,
        });
    }
    Ok(())
}

/// Read and decrypt a table of `entries` records at absolute `pos`
pub fn read_table<R: Read + Seek>(
    reader: &mut R,
    table: &'static str,
    pos: u64,
    entries: u32,
    key: u32,
) -> Result<Vec<u8>> {
    let stream_len = reader.seek(SeekFrom::End(0))?;
    check_entry_count(table, entries, Some(stream_len.saturating_sub(pos)))?;

    let mut raw = vec![0u8; entries as usize * TABLE_ENTRY_SIZE];
    reader.seek(SeekFrom::Start(pos))?;
    reader.read_exact(&mut raw)?;
    decrypt_bytes(&mut raw, key);

    log::debug!(
        "read {} table: {} entries at {:#x}",
        table,
        entries,
        pos
    );
    Ok(raw)
}

/// Encrypt a serialized table and write it at absolute `pos`
pub fn write_table<W: Write + Seek>(
    writer: &mut W,
    table: &'static str,
    pos: u64,
    mut plain: Vec<u8>,
    key: u32,
) -> Result<()> {
    encrypt_bytes(&mut plain, key);
    writer.seek(SeekFrom::Start(pos))?;
    writer.write_all(&plain)?;

    log::debug!(
        "wrote {} table: {} entries at {:#x}",
        table,
        plain.len() / TABLE_ENTRY_SIZE,
        pos
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_table_key;
    use std::io::Cursor;

    #[test]
    fn test_round_trip() {
        let plain: Vec<u8> = (0..64u8).collect();
        let mut cursor = Cursor::new(vec![0u8; 16]);

        write_table(&mut cursor, "hash", 16, plain.clone(), hash_table_key()).unwrap();
        let stored = cursor.get_ref()[16..].to_vec();
        assert_ne!(stored, plain);

        let read = read_table(&mut cursor, "hash", 16, 4, hash_table_key()).unwrap();
        assert_eq!(read, plain);
    }

    #[test]
    fn test_entry_limits() {
        assert!(check_entry_count("hash", 16, None).is_ok());
        assert!(matches!(
            check_entry_count("hash", 0xFFFF_FFFE, None),
            Err(Error::TableTooLarge { .. })
        ));
        assert!(check_entry_count("block", 4, Some(63)).is_err());
        assert!(check_entry_count("block", 4, Some(64)).is_ok());
    }

    #[test]
    fn test_truncated_table() {
        let mut cursor = Cursor::new(vec![0u8; 40]);
        let result = read_table(&mut cursor, "block", 0, 4, 1);
        assert!(matches!(result, Err(Error::TableTooLarge { .. })));
    }
}
