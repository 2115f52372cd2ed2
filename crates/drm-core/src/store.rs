//! Persisted discovery results
//!
//! The discovery table is the only persisted state. It is restored when the
//! manager is built and written back whenever a discovery scan completes.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store rejected block: {0}")]
    Rejected(String),
}

/// Non-volatile block holding the packed discovery table
pub trait DiscoveryStore: Send + Sync {
    /// Read the stored block, `None` when nothing was written yet
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the stored block
    fn store(&self, block: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store, used when no persistence is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    block: Mutex<Option<Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a block, as if written by a previous run
    pub fn with_block(block: Vec<u8>) -> Self {
        Self {
            block: Mutex::new(Some(block)),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn block(&self) -> Option<Vec<u8>> {
        self.block.lock().clone()
    }

    /// Number of successful `store` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl DiscoveryStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.block.lock().clone())
    }

    fn store(&self, block: &[u8]) -> Result<(), StoreError> {
        *self.block.lock() = Some(block.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
