//! Record manager: the public face of the store.
//!
//! Callers store opaque byte records and get back a [`Recid`] that stays
//! valid until the record is deleted. Changes accumulate in a transaction
//! until [`RecordManager::commit`] or [`RecordManager::rollback`].

mod maintenance;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{validate_block_size, StoreConfig};
use crate::storage::buffer::{BlockBuffer, TxnState};
use crate::storage::disk::BlockStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::logical::{lookup, LogicalIds, Recid, TranslationMap};
use crate::storage::page::header::{max_class_slots, probe_geometry, PROBE_LEN};
use crate::storage::page::{FileHeader, ROOT_SLOTS};
use crate::storage::physical::{self, PhysicalRecords, SizeClasses};
use crate::storage::wal::TransactionLog;

pub use maintenance::{DefragSummary, StoreStats, VerifyReport};

/// Cloneable handle to an open store. Reads share a lock; every mutation,
/// commit and rollback takes it exclusively.
#[derive(Clone)]
pub struct RecordManager {
    inner: Arc<RwLock<StoreInner>>,
}

struct StoreInner {
    path: PathBuf,
    config: StoreConfig,
    /// `None` once the store is closed.
    engine: Option<Engine>,
    /// Set by the first fatal error; the store refuses work until reopened.
    poisoned: Mutex<Option<String>>,
}

impl StoreInner {
    fn engine(&self) -> StorageResult<&Engine> {
        if let Some(reason) = self.poisoned.lock().as_ref() {
            return Err(StorageError::Poisoned(reason.clone()));
        }
        self.engine.as_ref().ok_or(StorageError::Closed)
    }

    fn engine_mut(&mut self) -> StorageResult<&mut Engine> {
        if let Some(reason) = self.poisoned.lock().as_ref() {
            return Err(StorageError::Poisoned(reason.clone()));
        }
        self.engine.as_mut().ok_or(StorageError::Closed)
    }

    fn observe<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("store {} poisoned: {}", self.path.display(), e);
                let mut poisoned = self.poisoned.lock();
                if poisoned.is_none() {
                    *poisoned = Some(e.to_string());
                }
            }
        }
        result
    }
}

impl RecordManager {
    /// Create a new, empty store at `path`, replacing any existing one.
    pub fn create(path: &Path, config: StoreConfig) -> StorageResult<Self> {
        config.validate()?;
        let engine = Engine::create(path, &config)?;
        info!(
            "created store {} (block size {})",
            path.display(),
            config.block_size
        );
        Ok(Self::from_engine(path, config, engine))
    }

    /// Open an existing store, replaying or discarding any leftover log.
    pub fn open(path: &Path, config: StoreConfig) -> StorageResult<Self> {
        config.validate()?;
        let engine = Engine::open(path, &config)?;
        info!(
            "opened store {} ({} blocks of {} bytes)",
            path.display(),
            engine.buf.num_blocks(),
            engine.buf.block_size()
        );
        Ok(Self::from_engine(path, config, engine))
    }

    fn from_engine(path: &Path, config: StoreConfig, engine: Engine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                path: path.to_path_buf(),
                config,
                engine: Some(engine),
                poisoned: Mutex::new(None),
            })),
        }
    }

    fn read<T>(&self, op: impl FnOnce(&Engine) -> StorageResult<T>) -> StorageResult<T> {
        let inner = self.inner.read();
        let result = inner.engine().and_then(op);
        inner.observe(result)
    }

    fn write<T>(&self, op: impl FnOnce(&mut Engine) -> StorageResult<T>) -> StorageResult<T> {
        let mut inner = self.inner.write();
        let result = inner.engine_mut().and_then(op);
        inner.observe(result)
    }

    pub fn path(&self) -> PathBuf {
        self.inner.read().path.clone()
    }

    pub fn block_size(&self) -> StorageResult<usize> {
        self.read(|engine| Ok(engine.buf.block_size()))
    }

    pub fn transaction_state(&self) -> StorageResult<TxnState> {
        self.read(|engine| Ok(engine.buf.state()))
    }

    pub fn insert(&self, data: &[u8]) -> StorageResult<Recid> {
        self.write(|engine| engine.insert(data))
    }

    pub fn fetch(&self, recid: Recid) -> StorageResult<Vec<u8>> {
        self.read(|engine| engine.fetch(recid))
    }

    pub fn update(&self, recid: Recid, data: &[u8]) -> StorageResult<()> {
        self.write(|engine| engine.update(recid, data))
    }

    pub fn delete(&self, recid: Recid) -> StorageResult<()> {
        self.write(|engine| engine.delete(recid))
    }

    pub fn commit(&self) -> StorageResult<()> {
        self.write(|engine| {
            let written = engine.buf.commit()?;
            debug!("commit wrote {} blocks", written);
            Ok(())
        })
    }

    /// Discard every change since the last commit.
    pub fn rollback(&self) -> StorageResult<()> {
        self.write(|engine| engine.rollback())
    }

    /// Value of root slot `slot` (0 when never set).
    pub fn get_root(&self, slot: usize) -> StorageResult<u64> {
        check_root_slot(slot)?;
        self.read(|engine| Ok(engine.buf.header()?.root(slot)))
    }

    pub fn set_root(&self, slot: usize, value: u64) -> StorageResult<()> {
        check_root_slot(slot)?;
        self.write(|engine| {
            engine.buf.header_mut()?.set_root(slot, value);
            Ok(())
        })
    }

    /// Recid registered under `name` in the named-object directory.
    pub fn named_object(&self, name: &str) -> StorageResult<Option<Recid>> {
        self.read(|engine| Ok(engine.directory()?.get(name).copied()))
    }

    /// Register `recid` under `name`, or remove the name when `recid` is
    /// `None`.
    pub fn set_named_object(&self, name: &str, recid: Option<Recid>) -> StorageResult<()> {
        self.write(|engine| {
            let mut directory = engine.directory()?;
            match recid {
                Some(recid) => directory.insert(name.to_string(), recid),
                None => directory.remove(name),
            };
            engine.store_directory(&directory)
        })
    }

    /// Commit pending changes and release the store. Later calls on any
    /// clone of this handle fail with [`StorageError::Closed`].
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let poisoned = inner.poisoned.lock().is_some();
        if let Some(mut engine) = inner.engine.take() {
            if !poisoned {
                engine.buf.commit()?;
            }
            info!("closed store {}", inner.path.display());
        }
        Ok(())
    }
}

fn check_root_slot(slot: usize) -> StorageResult<()> {
    if slot >= ROOT_SLOTS {
        return Err(StorageError::InvalidArgument(format!(
            "root slot {} out of range (0..{})",
            slot, ROOT_SLOTS
        )));
    }
    Ok(())
}

/// The open store: buffer plus the in-memory state derived from it.
struct Engine {
    buf: BlockBuffer,
    classes: SizeClasses,
    map: TranslationMap,
}

impl Engine {
    fn create(path: &Path, config: &StoreConfig) -> StorageResult<Self> {
        let classes = SizeClasses::for_block_size(config.block_size);
        if classes.len() > max_class_slots(config.block_size) {
            return Err(StorageError::Config(format!(
                "block size {} cannot track {} size classes",
                config.block_size,
                classes.len()
            )));
        }

        let store = BlockStore::create(path, config.block_size, config.max_file_blocks)?;
        let log_path = TransactionLog::path_for(path);
        let log = if config.transactions_enabled {
            let mut log = TransactionLog::open(&log_path, config.sync_on_commit)?;
            log.truncate()?;
            Some(log)
        } else {
            if log_path.exists() {
                fs::remove_file(&log_path)?;
            }
            None
        };

        let mut buf = BlockBuffer::new(store, log, config.sync_on_commit)?;
        let header = buf.append();
        FileHeader::init(buf.write(header)?, classes.len())
            .set_max_file_blocks(config.max_file_blocks)?;
        buf.commit()?;

        let map = TranslationMap::load(&buf)?;
        Ok(Self { buf, classes, map })
    }

    fn open(path: &Path, config: &StoreConfig) -> StorageResult<Self> {
        let geometry = {
            let mut prefix = vec![0u8; PROBE_LEN];
            File::open(path)?.read_exact(&mut prefix)?;
            probe_geometry(&prefix)?
        };
        let block_size = geometry.block_size;
        validate_block_size(block_size)?;
        if block_size != config.block_size {
            debug!(
                "{} uses block size {}, overriding configured {}",
                path.display(),
                block_size,
                config.block_size
            );
        }
        if geometry.max_file_blocks != config.max_file_blocks {
            debug!(
                "{} uses file split {:?}, overriding configured {:?}",
                path.display(),
                geometry.max_file_blocks,
                config.max_file_blocks
            );
        }

        let store = BlockStore::open(path, block_size, geometry.max_file_blocks)?;
        let log_path = TransactionLog::path_for(path);
        let log = if config.transactions_enabled || log_path.exists() {
            Some(TransactionLog::open(&log_path, config.sync_on_commit)?)
        } else {
            None
        };

        let mut buf = BlockBuffer::new(store, log, config.sync_on_commit)?;
        buf.recover()?;
        if !config.transactions_enabled && buf.detach_log().is_some() {
            fs::remove_file(&log_path)?;
        }

        let classes = SizeClasses::for_block_size(block_size);
        buf.header()?.validate(classes.len())?;
        let map = TranslationMap::load(&buf)?;
        let engine = Self { buf, classes, map };

        if config.verify_on_open {
            let report = engine.verify()?;
            if !report.is_ok() {
                return Err(StorageError::Corruption(report.problems.join("; ")));
            }
        }
        Ok(engine)
    }

    fn insert(&mut self, data: &[u8]) -> StorageResult<Recid> {
        let location = PhysicalRecords::new(&mut self.buf, &self.classes).insert(data)?;
        LogicalIds::new(&mut self.buf, &mut self.map).insert(location)
    }

    fn fetch(&self, recid: Recid) -> StorageResult<Vec<u8>> {
        let location = lookup(&self.buf, &self.map, recid)?;
        physical::fetch(&self.buf, location)
    }

    fn update(&mut self, recid: Recid, data: &[u8]) -> StorageResult<()> {
        let location = lookup(&self.buf, &self.map, recid)?;
        let moved = PhysicalRecords::new(&mut self.buf, &self.classes).update(location, data)?;
        if moved != location {
            LogicalIds::new(&mut self.buf, &mut self.map).update(recid, moved)?;
        }
        Ok(())
    }

    fn delete(&mut self, recid: Recid) -> StorageResult<()> {
        let location = lookup(&self.buf, &self.map, recid)?;
        PhysicalRecords::new(&mut self.buf, &self.classes).free(location)?;
        LogicalIds::new(&mut self.buf, &mut self.map).delete(recid)
    }

    fn rollback(&mut self) -> StorageResult<()> {
        if self.buf.state() == TxnState::Idle {
            return Ok(());
        }
        self.buf.rollback()?;
        self.buf.header()?.validate(self.classes.len())?;
        self.map = TranslationMap::load(&self.buf)?;
        Ok(())
    }

    fn directory(&self) -> StorageResult<BTreeMap<String, Recid>> {
        let recid = self.buf.header()?.name_directory();
        if recid == 0 {
            return Ok(BTreeMap::new());
        }
        let bytes = self.fetch(Recid(recid))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn store_directory(&mut self, directory: &BTreeMap<String, Recid>) -> StorageResult<()> {
        let bytes = bincode::serialize(directory)?;
        let recid = self.buf.header()?.name_directory();
        if recid == 0 {
            let recid = self.insert(&bytes)?;
            self.buf.header_mut()?.set_name_directory(recid.0);
        } else {
            self.update(Recid(recid), &bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn small_config() -> StoreConfig {
        StoreConfig::default().block_size(4096).sync_on_commit(false)
    }

    #[test]
    fn test_insert_fetch_commit() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rm.db");

        let recid = {
            let rm = RecordManager::create(&path, small_config())?;
            let recid = rm.insert(b"hello world")?;
            assert_eq!(rm.fetch(recid)?, b"hello world");
            rm.commit()?;
            recid
        };

        let rm = RecordManager::open(&path, small_config())?;
        assert_eq!(rm.fetch(recid)?, b"hello world");
        Ok(())
    }

    #[test]
    fn test_update_delete() -> Result<()> {
        let dir = tempdir()?;
        let rm = RecordManager::create(&dir.path().join("rm.db"), small_config())?;

        let recid = rm.insert(b"short")?;
        rm.update(recid, &vec![7u8; 10_000])?;
        assert_eq!(rm.fetch(recid)?, vec![7u8; 10_000]);

        rm.delete(recid)?;
        assert!(matches!(
            rm.fetch(recid),
            Err(StorageError::RecordNotFound(r)) if r == recid
        ));
        assert!(matches!(
            rm.update(recid, b"x"),
            Err(StorageError::RecordNotFound(_))
        ));
        assert!(matches!(
            rm.fetch(Recid(0)),
            Err(StorageError::InvalidRecid(_))
        ));

        // Caller mistakes do not poison the store
        let other = rm.insert(b"still fine")?;
        assert_eq!(rm.fetch(other)?, b"still fine");
        Ok(())
    }

    #[test]
    fn test_rollback() -> Result<()> {
        let dir = tempdir()?;
        let rm = RecordManager::create(&dir.path().join("rm.db"), small_config())?;

        let kept = rm.insert(b"kept")?;
        rm.commit()?;

        rm.update(kept, b"changed")?;
        let dropped = rm.insert(b"dropped")?;
        assert_eq!(rm.transaction_state()?, TxnState::Open);
        rm.rollback()?;

        assert_eq!(rm.transaction_state()?, TxnState::Idle);
        assert_eq!(rm.fetch(kept)?, b"kept");
        assert!(rm.fetch(dropped).is_err());

        rm.rollback()?;
        assert_eq!(rm.fetch(kept)?, b"kept");
        Ok(())
    }

    #[test]
    fn test_roots() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rm.db");
        {
            let rm = RecordManager::create(&path, small_config())?;
            assert_eq!(rm.get_root(3)?, 0);
            rm.set_root(3, 12345)?;
            rm.set_root(ROOT_SLOTS - 1, 1)?;
            assert!(matches!(
                rm.set_root(ROOT_SLOTS, 1),
                Err(StorageError::InvalidArgument(_))
            ));
            rm.commit()?;
        }
        let rm = RecordManager::open(&path, small_config())?;
        assert_eq!(rm.get_root(3)?, 12345);
        assert_eq!(rm.get_root(ROOT_SLOTS - 1)?, 1);
        Ok(())
    }

    #[test]
    fn test_named_objects() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rm.db");
        {
            let rm = RecordManager::create(&path, small_config())?;
            assert_eq!(rm.named_object("index")?, None);
            rm.set_named_object("index", Some(Recid(42)))?;
            rm.set_named_object("other", Some(Recid(7)))?;
            rm.set_named_object("other", None)?;
            rm.commit()?;
        }
        let rm = RecordManager::open(&path, small_config())?;
        assert_eq!(rm.named_object("index")?, Some(Recid(42)));
        assert_eq!(rm.named_object("other")?, None);
        Ok(())
    }

    #[test]
    fn test_close() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rm.db");
        let rm = RecordManager::create(&path, small_config())?;
        let recid = rm.insert(b"pending")?;
        let clone = rm.clone();
        rm.close()?;

        assert!(matches!(clone.fetch(recid), Err(StorageError::Closed)));
        assert!(matches!(rm.insert(b"x"), Err(StorageError::Closed)));

        // Close committed the pending insert
        let rm = RecordManager::open(&path, small_config())?;
        assert_eq!(rm.fetch(recid)?, b"pending");
        Ok(())
    }

    #[test]
    fn test_block_size_comes_from_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rm.db");
        RecordManager::create(&path, StoreConfig::default().block_size(16384))?.close()?;

        let rm = RecordManager::open(&path, StoreConfig::default())?;
        assert_eq!(rm.block_size()?, 16384);
        Ok(())
    }

    #[test]
    fn test_open_rejects_garbage() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("junk.db");
        fs::write(&path, vec![0xEEu8; 8192])?;
        assert!(matches!(
            RecordManager::open(&path, small_config()),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_corruption_poisons_store() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rm.db");
        let recid = {
            let rm = RecordManager::create(&path, small_config())?;
            let recid = rm.insert(b"victim")?;
            rm.commit()?;
            recid
        };

        // Smash the data page holding the record
        let rm = RecordManager::open(&path, small_config())?;
        let location = rm.read(|engine| lookup(&engine.buf, &engine.map, recid))?;
        {
            let mut inner = rm.inner.write();
            let engine = inner.engine.as_mut().unwrap();
            engine.buf.write(location.block())?[location.offset()] = 0x7F;
        }

        assert!(matches!(rm.fetch(recid), Err(StorageError::Corruption(_))));
        assert!(matches!(rm.insert(b"x"), Err(StorageError::Poisoned(_))));
        Ok(())
    }
}
