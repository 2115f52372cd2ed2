//! File-backed discovery store

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use drm_core::store::{DiscoveryStore, StoreError};
use tracing::debug;

/// Keeps the packed discovery table in a small binary file
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DiscoveryStore for FileStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(block) => Ok(Some(block)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, block: &[u8]) -> Result<(), StoreError> {
        // Replace atomically
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, block)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = block.len(), "Discovery table written");
        Ok(())
    }
}
