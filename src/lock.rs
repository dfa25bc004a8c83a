//! Inter-process advisory locks.
//!
//! Every mutating operation on shared state (rebuilding the API cache,
//! relocating a keg) holds a [`FileLock`] named after what it mutates. Locks
//! live in `<cache>/locks/<name>.lock` and are released when the guard drops,
//! including on error paths.

use crate::error::{PourError, Result};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive lock held until dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until `<dir>/<name>.lock` is ours or `timeout` has passed.
    ///
    /// A zero timeout tries exactly once.
    pub fn acquire(dir: &Path, name: &str, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| PourError::io(dir, e))?;
        let path = dir.join(format!("{}.lock", sanitize(name)));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| PourError::io(&path, e))?;

        let started = Instant::now();
        let mut waiting_logged = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!("Acquired lock {}", path.display());
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(PourError::Lock {
                            path,
                            waited_secs: timeout.as_secs(),
                        });
                    }
                    if !waiting_logged {
                        tracing::info!("Waiting for lock {}", path.display());
                        waiting_logged = true;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(PourError::io(&path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Keg paths and formula names both end up as lock names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "@._-".contains(c) { c } else { '_' })
        .collect()
}
