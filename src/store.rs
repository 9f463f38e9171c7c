//! Durable pair registry persisted as JSON
//!
//! A missing file means an empty registry. A corrupt file is logged and
//! likewise treated as empty rather than blocking startup.

use crate::pair::ProcessPair;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PairStore {
    path: PathBuf,
}

impl PairStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all persisted pairs. Never fails: unreadable or corrupt state
    /// degrades to an empty list.
    pub fn load_all(&self) -> Vec<ProcessPair> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read pair store");
                return Vec::new();
            }
        };
        match serde_json::from_slice(&data) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "pair store is corrupt, starting empty");
                Vec::new()
            }
        }
    }

    /// Atomically replace the persisted set via a temp file and rename.
    pub fn save_all(&self, pairs: &[ProcessPair]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(pairs)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), count = pairs.len(), "pair store saved");
        Ok(())
    }
}
