// src/image/lock.rs

//! Per-image mutation lock
//!
//! One mutating operation (solve, plan, execute) may hold the exclusive lock
//! of an image at a time. Read-only queries take the shared lock and may run
//! concurrently with each other, but not with a mutation.
//!
//! # Example
//!
//! ```ignore
//! let lock = ImageLock::exclusive(&paths::lock_path(root), 0)?;
//! // ... solve, plan, execute ...
//! drop(lock);
//! ```
//!
//! Lock calls name `fs2::FileExt` explicitly: `std::fs::File` has inherent
//! methods of the same names with a different error type.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on an image, released on drop
#[derive(Debug)]
pub struct ImageLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl ImageLock {
    /// Take the exclusive mutation lock
    ///
    /// Contention is retried `retries` times, then reported as `LockContention`.
    pub fn exclusive<P: AsRef<Path>>(path: P, retries: u32) -> Result<Self> {
        Self::acquire(path.as_ref(), LockMode::Exclusive, retries)
    }

    /// Take a shared (read-only) lock
    pub fn shared<P: AsRef<Path>>(path: P, retries: u32) -> Result<Self> {
        Self::acquire(path.as_ref(), LockMode::Shared, retries)
    }

    fn acquire(path: &Path, mode: LockMode, retries: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut attempt = 0;
        loop {
            let result = match mode {
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
                LockMode::Shared => FileExt::try_lock_shared(&file),
            };

            match result {
                Ok(()) => {
                    debug!("Acquired {:?} image lock at {:?}", mode, path);
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        mode,
                    });
                }
                Err(e) if is_contention(&e) => {
                    if attempt >= retries {
                        info!("Image lock at {:?} is held by another operation", path);
                        return Err(Error::LockContention {
                            path: path.display().to_string(),
                        });
                    }
                    attempt += 1;
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Check whether any process holds the exclusive lock
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => return false,
        };

        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

fn is_contention(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released {:?} image lock at {:?}", self.mode, self.path);
    }
}
