//! Leader lock guaranteeing a single supervisor per state directory
//!
//! Backed by an advisory `flock` on a lock file. The kernel releases the
//! lock when the holding process exits for any reason, so a crashed holder
//! never leaves the lock stuck.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock scoping one supervisor to a state directory.
///
/// Dropping the lock releases it; so does process exit.
#[derive(Debug)]
pub struct LeaderLock {
    path: PathBuf,
    file: Option<File>,
}

impl LeaderLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock. `Ok(false)` means another live process holds it.
    pub fn acquire(&mut self) -> io::Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                debug!(path = %self.path.display(), "leader lock held elsewhere");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        // Informational only; the flock is what matters.
        file.set_len(0)?;
        let mut f = &file;
        writeln!(f, "{}", std::process::id())?;
        self.file = Some(file);
        debug!(path = %self.path.display(), "leader lock acquired");
        Ok(true)
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Safe to call when not held.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                debug!(path = %self.path.display(), error = %e, "failed to unlock leader lock");
            }
        }
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        self.release();
    }
}
