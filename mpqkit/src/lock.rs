//! Advisory single-writer lock
//!
//! The lock is a `<archive>.lock` file created exclusively next to the
//! archive and holding the owner's pid. Only cooperating processes honour
//! it. A lock whose owner has exited is taken over where the platform can
//! tell (Linux, through `/proc`).

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Held for the duration of one mutation; released on drop
#[derive(Debug)]
pub struct ArchiveLock {
    file: File,
    path: PathBuf,
}

impl ArchiveLock {
    /// Path of the lock file guarding `archive`
    pub fn lock_path(archive: &Path) -> PathBuf {
        let mut name = archive.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the lock, retrying every 50 ms until `timeout` expires
    pub fn acquire(archive: &Path, timeout: Duration) -> Result<Self> {
        let path = Self::lock_path(archive);
        let start = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    // dropping the guard removes the file if the pid write fails
                    let mut lock = Self { file, path };
                    writeln!(lock.file, "{}", std::process::id())?;
                    log::debug!("acquired archive lock {}", lock.path.display());
                    return Ok(lock);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = lock_owner(&path);
                    if let Some(pid) = owner.filter(|&pid| process_alive(pid) == Some(false)) {
                        log::warn!(
                            "taking over archive lock {} left by exited process {}",
                            path.display(),
                            pid
                        );
                        match std::fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(Error::Io(e)),
                        }
                    }

                    if start.elapsed() >= timeout {
                        let holder = match owner {
                            Some(pid) => format!("process {}", pid),
                            None => "an unknown owner".to_string(),
                        };
                        return Err(Error::Locked(format!(
                            "{} still held by {} after {:?}",
                            path.display(),
                            holder,
                            timeout
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Path of the held lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Pid recorded in an existing lock file; `None` while the owner has not
/// written it yet
fn lock_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `pid` is running, where the platform lets us tell
fn process_alive(pid: u32) -> Option<bool> {
    if cfg!(target_os = "linux") {
        Some(Path::new("/proc").join(pid.to_string()).exists())
    } else {
        None
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("failed to remove archive lock {}: {}", self.path.display(), e);
        }
    }
}
