//! Workspace lock.
//!
//! Exactly one controller may own a project workspace at a time. The lock
//! is an OS advisory lock on `.lock` inside the state store's base
//! directory, held for the duration of `execute`/`resume` and released on
//! drop (or by the OS if the process dies).

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::KernelError;

#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Try to take the exclusive workspace lock. Fails immediately with
    /// `KernelError::WorkspaceLocked` when another process holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self, KernelError> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| KernelError::Persistence(anyhow::Error::new(e)))?;
        let path = state_dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| KernelError::Persistence(anyhow::Error::new(e)))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(_) => Err(KernelError::WorkspaceLocked { path }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        // Advisory locks also release when the file closes; unlocking
        // explicitly just makes the release immediate.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
