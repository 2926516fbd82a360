//! Store configuration.

use crate::storage::error::{StorageError, StorageResult};

/// Default block size (8 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Largest supported block size. Slot sizes and in-page offsets are 16-bit.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Configuration for a record store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Block size used when creating a store. Ignored on open, where the size
    /// recorded in the file header wins.
    pub block_size: usize,
    /// Whether commits go through the transaction log.
    pub transactions_enabled: bool,
    /// Whether to fsync the log and the data files on every commit.
    pub sync_on_commit: bool,
    /// Maximum number of blocks per backing file. `None` keeps everything in
    /// a single file. Ignored on open, where the split recorded in the file
    /// header wins.
    pub max_file_blocks: Option<u64>,
    /// Run the integrity check right after opening an existing store.
    pub verify_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            transactions_enabled: true,
            sync_on_commit: true,
            max_file_blocks: None,
            verify_on_open: false,
        }
    }
}

impl StoreConfig {
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn transactions_enabled(mut self, enabled: bool) -> Self {
        self.transactions_enabled = enabled;
        self
    }

    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn max_file_blocks(mut self, blocks: Option<u64>) -> Self {
        self.max_file_blocks = blocks;
        self
    }

    pub fn verify_on_open(mut self, verify: bool) -> Self {
        self.verify_on_open = verify;
        self
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> StorageResult<()> {
        validate_block_size(self.block_size)?;
        if let Some(blocks) = self.max_file_blocks {
            if blocks == 0 || blocks > u32::MAX as u64 {
                return Err(StorageError::Config(format!(
                    "max_file_blocks must be between 1 and {}, got {}",
                    u32::MAX,
                    blocks
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_block_size(size: usize) -> StorageResult<()> {
    if !size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
        return Err(StorageError::Config(format!(
            "block size must be a power of two between {} and {}, got {}",
            MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, size
        )));
    }
    Ok(())
}
