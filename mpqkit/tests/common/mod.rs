//! Shared helpers for integration tests

#![allow(dead_code)]

use mpqkit::{Archive, ArchiveConfig, FormatVersion};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Route `log` output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small tables and 512-byte sectors so multi-sector files stay small
pub fn small_config(format_version: FormatVersion) -> ArchiveConfig {
    ArchiveConfig {
        format_version,
        sector_size_shift: 0,
        hash_table_entries: 32,
        block_table_entries: 16,
        lock_timeout: Duration::from_millis(200),
        ..ArchiveConfig::default()
    }
}

/// A fresh writable archive in its own temporary directory
pub fn new_archive(config: ArchiveConfig) -> (TempDir, PathBuf, Archive) {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.mpq");
    let archive = Archive::create(&path, config).expect("create archive");
    (dir, path, archive)
}

/// Deterministic, moderately compressible payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 7) as u8).wrapping_mul(31).wrapping_add(seed) ^ (i as u8 & 0x3))
        .collect()
}
