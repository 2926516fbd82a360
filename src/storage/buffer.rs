//! Transactional block buffer.
//!
//! Every block modified by the open transaction is held in memory together
//! with the image it had when the transaction first touched it. Nothing is
//! written to the store until commit, so a rollback only has to forget the
//! dirty set.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::storage::disk::BlockStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{BlockId, FileHeader};
use crate::storage::wal::{LogContents, TransactionLog};

/// Transaction state of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Open,
    Committing,
}

/// Read access to a block: borrowed from the dirty set or freshly read from
/// the store.
pub enum BlockRef<'a> {
    Dirty(&'a [u8]),
    Clean(Vec<u8>),
}

impl AsRef<[u8]> for BlockRef<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Deref for BlockRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BlockRef::Dirty(data) => data,
            BlockRef::Clean(data) => data,
        }
    }
}

pub struct BlockBuffer {
    store: Mutex<BlockStore>,
    /// `None` when transactions are disabled.
    log: Option<TransactionLog>,
    block_size: usize,
    sync_on_commit: bool,
    /// Block count including blocks appended by the open transaction.
    num_blocks: u64,
    dirty: HashMap<BlockId, Vec<u8>>,
    /// Dirty blocks in first-touch order.
    touched: Vec<BlockId>,
    /// Image of each dirty block before the transaction touched it. `None`
    /// for blocks appended by the transaction.
    pre_images: HashMap<BlockId, Option<Vec<u8>>>,
    state: TxnState,
}

impl BlockBuffer {
    pub fn new(
        store: BlockStore,
        log: Option<TransactionLog>,
        sync_on_commit: bool,
    ) -> StorageResult<Self> {
        let num_blocks = store.num_blocks()?;
        Ok(Self {
            block_size: store.block_size(),
            store: Mutex::new(store),
            log,
            sync_on_commit,
            num_blocks,
            dirty: HashMap::new(),
            touched: Vec::new(),
            pre_images: HashMap::new(),
            state: TxnState::Idle,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn transactions_enabled(&self) -> bool {
        self.log.is_some()
    }

    pub fn dirty_count(&self) -> usize {
        self.touched.len()
    }

    pub fn store_path(&self) -> PathBuf {
        self.store.lock().path().to_path_buf()
    }

    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.store.lock().file_paths()
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log.as_ref().map(|log| log.path().to_path_buf())
    }

    /// Stop logging commits. Used after recovery when transactions are off.
    pub fn detach_log(&mut self) -> Option<TransactionLog> {
        self.log.take()
    }

    pub fn read(&self, block: BlockId) -> StorageResult<BlockRef<'_>> {
        if let Some(data) = self.dirty.get(&block) {
            return Ok(BlockRef::Dirty(data));
        }
        self.check_exists(block)?;
        let mut data = vec![0u8; self.block_size];
        self.store.lock().read_block(block, &mut data)?;
        Ok(BlockRef::Clean(data))
    }

    /// Writable image of `block`. The first call in a transaction captures
    /// the pre-image.
    pub fn write(&mut self, block: BlockId) -> StorageResult<&mut [u8]> {
        if !self.dirty.contains_key(&block) {
            self.check_exists(block)?;
            let mut data = vec![0u8; self.block_size];
            self.store.lock().read_block(block, &mut data)?;
            self.pre_images.insert(block, Some(data.clone()));
            self.dirty.insert(block, data);
            self.touched.push(block);
            self.state = TxnState::Open;
        }
        self.dirty
            .get_mut(&block)
            .map(|data| data.as_mut_slice())
            .ok_or_else(|| StorageError::Corruption(format!("dirty block {} vanished", block)))
    }

    pub fn header(&self) -> StorageResult<FileHeader<BlockRef<'_>>> {
        Ok(FileHeader::from_data(self.read(BlockId::NONE)?))
    }

    pub fn header_mut(&mut self) -> StorageResult<FileHeader<&mut [u8]>> {
        Ok(FileHeader::from_data(self.write(BlockId::NONE)?))
    }

    /// Extend the store by one zeroed block, owned by the open transaction.
    pub fn append(&mut self) -> BlockId {
        let block = BlockId(self.num_blocks);
        self.num_blocks += 1;
        self.dirty.insert(block, vec![0u8; self.block_size]);
        self.pre_images.insert(block, None);
        self.touched.push(block);
        self.state = TxnState::Open;
        block
    }

    /// Make the open transaction durable. Returns the number of blocks
    /// written to the store.
    pub fn commit(&mut self) -> StorageResult<usize> {
        if self.state == TxnState::Idle {
            return Ok(0);
        }
        self.state = TxnState::Committing;

        let changed: Vec<BlockId> = self
            .touched
            .iter()
            .copied()
            .filter(|block| match self.pre_images.get(block) {
                Some(Some(before)) => self.dirty.get(block) != Some(before),
                _ => true,
            })
            .collect();

        let images = changed.iter().filter_map(|block| {
            self.dirty.get(block).map(|data| (*block, data.as_slice()))
        });

        if let Some(log) = self.log.as_mut() {
            log.write_transaction(images.clone())?;
        }

        {
            let mut store = self.store.lock();
            for (block, data) in images {
                store.write_block(block, data)?;
            }
            if self.sync_on_commit {
                store.sync()?;
            }
        }

        if let Some(log) = self.log.as_mut() {
            log.truncate()?;
        }

        debug!(
            "committed {} of {} touched blocks",
            changed.len(),
            self.touched.len()
        );
        self.clear();
        Ok(changed.len())
    }

    /// Forget every change of the open transaction. A no-op when idle.
    pub fn rollback(&mut self) -> StorageResult<()> {
        if self.state == TxnState::Idle {
            return Ok(());
        }
        let discarded = self.touched.len();
        self.clear();
        self.num_blocks = self.store.lock().num_blocks()?;
        if let Some(log) = self.log.as_mut() {
            log.truncate()?;
        }
        debug!("rolled back {} dirty blocks", discarded);
        Ok(())
    }

    /// Bring the store up to date with the log left behind by an earlier
    /// session. Returns the number of replayed blocks.
    pub fn recover(&mut self) -> StorageResult<usize> {
        let log = match self.log.as_mut() {
            Some(log) => log,
            None => return Ok(0),
        };

        let replayed = match log.read()? {
            LogContents::Empty => return Ok(0),
            LogContents::Committed(images) => {
                let mut store = self.store.lock();
                for (block, image) in &images {
                    if image.len() != self.block_size {
                        return Err(StorageError::Corruption(format!(
                            "log image of block {} is {} bytes, expected {}",
                            block,
                            image.len(),
                            self.block_size
                        )));
                    }
                    store.write_block(*block, image)?;
                }
                store.sync()?;
                info!(
                    "replayed {} committed block images from {}",
                    images.len(),
                    log.path().display()
                );
                images.len()
            }
            LogContents::Torn { bytes } => {
                warn!(
                    "discarding {} bytes of incomplete transaction log {}",
                    bytes,
                    log.path().display()
                );
                0
            }
        };

        log.truncate()?;
        self.num_blocks = self.store.lock().num_blocks()?;
        Ok(replayed)
    }

    fn clear(&mut self) {
        self.dirty.clear();
        self.touched.clear();
        self.pre_images.clear();
        self.state = TxnState::Idle;
    }

    fn check_exists(&self, block: BlockId) -> StorageResult<()> {
        if block.0 >= self.num_blocks {
            return Err(StorageError::Corruption(format!(
                "block {} is past the end of the store ({} blocks)",
                block, self.num_blocks
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::path::Path;
    use tempfile::tempdir;

    const BS: usize = 4096;

    fn create_buffer(path: &Path, transactional: bool) -> Result<BlockBuffer> {
        let store = BlockStore::create(path, BS, None)?;
        let log = if transactional {
            Some(TransactionLog::open(&TransactionLog::path_for(path), false)?)
        } else {
            None
        };
        Ok(BlockBuffer::new(store, log, false)?)
    }

    fn open_buffer(path: &Path) -> Result<BlockBuffer> {
        let store = BlockStore::open(path, BS, None)?;
        let log = TransactionLog::open(&TransactionLog::path_for(path), false)?;
        Ok(BlockBuffer::new(store, Some(log), false)?)
    }

    #[test]
    fn test_append_and_commit() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let mut buffer = create_buffer(&path, true)?;

        let block = buffer.append();
        assert_eq!(block, BlockId(0));
        assert_eq!(buffer.state(), TxnState::Open);
        buffer.write(block)?[0] = 42;
        assert_eq!(buffer.read(block)?[0], 42);

        assert_eq!(buffer.commit()?, 1);
        assert_eq!(buffer.state(), TxnState::Idle);
        assert_eq!(buffer.read(block)?[0], 42);

        let reopened = open_buffer(&path)?;
        assert_eq!(reopened.num_blocks(), 1);
        assert_eq!(reopened.read(block)?[0], 42);
        Ok(())
    }

    #[test]
    fn test_rollback_discards_changes() -> Result<()> {
        let dir = tempdir()?;
        let mut buffer = create_buffer(&dir.path().join("test.db"), true)?;

        let block = buffer.append();
        buffer.write(block)?[0] = 1;
        buffer.commit()?;

        buffer.write(block)?[0] = 2;
        let extra = buffer.append();
        assert_eq!(buffer.num_blocks(), 2);

        buffer.rollback()?;
        assert_eq!(buffer.read(block)?[0], 1);
        assert_eq!(buffer.num_blocks(), 1);
        assert!(buffer.read(extra).is_err());

        // Rollback when idle does nothing
        buffer.rollback()?;
        assert_eq!(buffer.read(block)?[0], 1);
        Ok(())
    }

    #[test]
    fn test_unchanged_blocks_are_not_written() -> Result<()> {
        let dir = tempdir()?;
        let mut buffer = create_buffer(&dir.path().join("test.db"), true)?;

        let a = buffer.append();
        let b = buffer.append();
        buffer.commit()?;

        buffer.write(a)?[10] = 7;
        buffer.write(b)?;
        assert_eq!(buffer.dirty_count(), 2);
        assert_eq!(buffer.commit()?, 1);
        Ok(())
    }

    #[test]
    fn test_commit_truncates_log() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let mut buffer = create_buffer(&path, true)?;

        let block = buffer.append();
        buffer.write(block)?[0] = 9;
        buffer.commit()?;

        let log_path = TransactionLog::path_for(&path);
        assert_eq!(std::fs::metadata(log_path)?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_recover_replays_committed_log() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        {
            let mut buffer = create_buffer(&path, true)?;
            buffer.append();
            buffer.append();
            buffer.commit()?;
        }

        // A transaction that reached the log but never the store
        let image = vec![0x5Au8; BS];
        {
            let mut log = TransactionLog::open(&TransactionLog::path_for(&path), false)?;
            log.write_transaction(vec![(BlockId(1), &image[..])])?;
        }

        let mut buffer = open_buffer(&path)?;
        assert_eq!(buffer.read(BlockId(1))?[0], 0);
        assert_eq!(buffer.recover()?, 1);
        assert_eq!(&*buffer.read(BlockId(1))?, &image[..]);

        // Replaying again finds an empty log
        assert_eq!(buffer.recover()?, 0);
        Ok(())
    }

    #[test]
    fn test_transactionless_commit() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let mut buffer = create_buffer(&path, false)?;
        assert!(!buffer.transactions_enabled());

        let block = buffer.append();
        buffer.write(block)?[3] = 3;
        buffer.commit()?;
        assert!(!TransactionLog::path_for(&path).exists());

        let reopened = BlockBuffer::new(BlockStore::open(&path, BS, None)?, None, false)?;
        assert_eq!(reopened.read(block)?[3], 3);
        Ok(())
    }
}
