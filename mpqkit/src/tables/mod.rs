//! Hash and block tables

pub mod block_table;
pub mod codec;
pub mod hash_table;

pub use block_table::{BlockEntry, BlockFlags, BlockTable};
pub use codec::{read_table, write_table, TABLE_ENTRY_SIZE};
pub use hash_table::{HashEntry, HashTable, ProbeKey};
