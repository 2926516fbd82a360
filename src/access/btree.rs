//! Persistent B+Tree over the record manager.
//!
//! Every node is a record. The tree itself is identified by the recid of a
//! small header record holding the root, height and entry count; the header
//! is re-read on every operation so a rollback of the store is always
//! reflected in the tree.

pub mod cursor;
mod node;

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use self::node::{Context, Node};
use crate::access::comparator::Comparator;
use crate::access::listener::RecordListener;
use crate::access::serializer::{BincodeSerializer, Serializer};
use crate::record_manager::RecordManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::logical::Recid;

pub use self::cursor::Cursor;

/// Slots per node unless the caller picks another size.
pub const DEFAULT_PAGE_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeHeader {
    root: Option<Recid>,
    height: u32,
    size: u64,
    page_size: u32,
}

pub struct BTree<K, V> {
    rm: RecordManager,
    recid: Recid,
    page_size: usize,
    comparator: Box<dyn Comparator<K>>,
    key_serializer: Box<dyn Serializer<K>>,
    value_serializer: Box<dyn Serializer<V>>,
    /// Shared for lookups and browsing, exclusive for changes.
    lock: RwLock<()>,
    listeners: RwLock<Vec<Arc<dyn RecordListener<K, V>>>>,
}

fn check_page_size(page_size: usize) -> StorageResult<()> {
    if page_size < 4 || page_size % 2 != 0 {
        return Err(StorageError::InvalidArgument(format!(
            "btree page size must be even and at least 4, got {}",
            page_size
        )));
    }
    Ok(())
}

impl<K, V> BTree<K, V>
where
    K: Serialize + DeserializeOwned + Clone + 'static,
    V: Serialize + DeserializeOwned + Clone + 'static,
{
    /// Create an empty tree with bincode-encoded keys and values.
    pub fn create(rm: &RecordManager, comparator: impl Comparator<K> + 'static) -> StorageResult<Self> {
        Self::create_with(
            rm,
            comparator,
            BincodeSerializer::new(),
            BincodeSerializer::new(),
            DEFAULT_PAGE_SIZE,
        )
    }

    /// Open a tree created by [`BTree::create`].
    pub fn load(
        rm: &RecordManager,
        recid: Recid,
        comparator: impl Comparator<K> + 'static,
    ) -> StorageResult<Self> {
        Self::load_with(
            rm,
            recid,
            comparator,
            BincodeSerializer::new(),
            BincodeSerializer::new(),
        )
    }
}

impl<K: Clone, V: Clone> BTree<K, V> {
    pub fn create_with(
        rm: &RecordManager,
        comparator: impl Comparator<K> + 'static,
        key_serializer: impl Serializer<K> + 'static,
        value_serializer: impl Serializer<V> + 'static,
        page_size: usize,
    ) -> StorageResult<Self> {
        check_page_size(page_size)?;
        let header = TreeHeader {
            root: None,
            height: 0,
            size: 0,
            page_size: page_size as u32,
        };
        let recid = rm.insert(&bincode::serialize(&header)?)?;
        debug!("created btree {} with page size {}", recid, page_size);
        Ok(Self::assemble(
            rm,
            recid,
            page_size,
            Box::new(comparator),
            Box::new(key_serializer),
            Box::new(value_serializer),
        ))
    }

    pub fn load_with(
        rm: &RecordManager,
        recid: Recid,
        comparator: impl Comparator<K> + 'static,
        key_serializer: impl Serializer<K> + 'static,
        value_serializer: impl Serializer<V> + 'static,
    ) -> StorageResult<Self> {
        let header: TreeHeader = bincode::deserialize(&rm.fetch(recid)?)?;
        let page_size = header.page_size as usize;
        if check_page_size(page_size).is_err() {
            return Err(StorageError::Corruption(format!(
                "btree {} records page size {}",
                recid, page_size
            )));
        }
        Ok(Self::assemble(
            rm,
            recid,
            page_size,
            Box::new(comparator),
            Box::new(key_serializer),
            Box::new(value_serializer),
        ))
    }

    fn assemble(
        rm: &RecordManager,
        recid: Recid,
        page_size: usize,
        comparator: Box<dyn Comparator<K>>,
        key_serializer: Box<dyn Serializer<K>>,
        value_serializer: Box<dyn Serializer<V>>,
    ) -> Self {
        Self {
            rm: rm.clone(),
            recid,
            page_size,
            comparator,
            key_serializer,
            value_serializer,
            lock: RwLock::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Recid of the tree header; pass it to [`BTree::load`] to reopen.
    pub fn recid(&self) -> Recid {
        self.recid
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of entries.
    pub fn size(&self) -> StorageResult<u64> {
        let _guard = self.lock.read();
        Ok(self.header()?.size)
    }

    /// Levels from root to leaves; 0 for an empty tree.
    pub fn height(&self) -> StorageResult<u32> {
        let _guard = self.lock.read();
        Ok(self.header()?.height)
    }

    pub fn add_listener(&self, listener: Arc<dyn RecordListener<K, V>>) {
        self.listeners.write().push(listener);
    }

    /// Insert `key`. If it is already present the stored value is returned
    /// and only overwritten when `replace` is set.
    pub fn insert(&self, key: K, value: V, replace: bool) -> StorageResult<Option<V>> {
        let existing = {
            let _guard = self.lock.write();
            self.insert_locked(&key, &value, replace)?
        };

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            match &existing {
                None => listener.inserted(&key, &value)?,
                Some(old) if replace => listener.updated(&key, old, &value)?,
                Some(_) => {}
            }
        }
        Ok(existing)
    }

    pub fn find(&self, key: &K) -> StorageResult<Option<V>> {
        let _guard = self.lock.read();
        let ctx = self.context();
        let header = self.header()?;
        let root = match header.root {
            Some(root) => root,
            None => return Ok(None),
        };

        let mut node = ctx.load(root)?;
        for _ in 1..header.height {
            let index = node.find_children(&ctx, key);
            node = ctx.load(node.child(index)?)?;
        }
        let index = node.find_children(&ctx, key);
        if ctx.matches(node.keys[index].as_ref(), key) {
            node.value(index)
        } else {
            Ok(None)
        }
    }

    /// Smallest entry whose key is at or above `key`.
    pub fn find_ceiling(&self, key: &K) -> StorageResult<Option<(K, V)>> {
        self.browse_from(key)?.next_entry()
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> StorageResult<Option<V>> {
        let removed = {
            let _guard = self.lock.write();
            self.remove_locked(key)?
        };

        if let Some(value) = &removed {
            let listeners = self.listeners.read().clone();
            for listener in &listeners {
                listener.removed(key, value)?;
            }
        }
        Ok(removed)
    }

    /// Cursor positioned before the smallest entry.
    pub fn browse(&self) -> StorageResult<Cursor<'_, K, V>> {
        let _guard = self.lock.read();
        let ctx = self.context();
        let header = self.header()?;
        let position = match header.root {
            None => None,
            Some(root) => {
                let mut node = ctx.load(root)?;
                for _ in 1..header.height {
                    node = ctx.load(node.child(node.first)?)?;
                }
                let index = node.first;
                Some((node, index))
            }
        };
        Ok(Cursor::new(self, position))
    }

    /// Cursor positioned before the first entry at or above `key`.
    pub fn browse_from(&self, key: &K) -> StorageResult<Cursor<'_, K, V>> {
        let _guard = self.lock.read();
        let ctx = self.context();
        let header = self.header()?;
        let position = match header.root {
            None => None,
            Some(root) => {
                let mut node = ctx.load(root)?;
                for _ in 1..header.height {
                    let index = node.find_children(&ctx, key);
                    node = ctx.load(node.child(index)?)?;
                }
                let index = node.find_children(&ctx, key);
                Some((node, index))
            }
        };
        Ok(Cursor::new(self, position))
    }

    fn insert_locked(&self, key: &K, value: &V, replace: bool) -> StorageResult<Option<V>> {
        let ctx = self.context();
        let mut header = self.header()?;
        let root = match header.root {
            Some(root) => root,
            None => {
                let leaf = ctx.create_root_leaf(key.clone(), value.clone())?;
                header.root = Some(leaf.recid);
                header.height = 1;
                header.size = 1;
                self.store_header(&header)?;
                return Ok(None);
            }
        };

        let mut node = ctx.load(root)?;
        let result = node.insert(&ctx, header.height as usize, key, value, replace)?;
        let mut dirty = false;
        if let Some((separator, overflow)) = result.overflow {
            let new_root = ctx.create_root(separator, overflow, &node)?;
            header.root = Some(new_root.recid);
            header.height += 1;
            dirty = true;
            debug!("btree {} grew to height {}", self.recid, header.height);
        }
        if result.existing.is_none() {
            header.size += 1;
            dirty = true;
        }
        if dirty {
            self.store_header(&header)?;
        }
        Ok(result.existing)
    }

    fn remove_locked(&self, key: &K) -> StorageResult<Option<V>> {
        let ctx = self.context();
        let mut header = self.header()?;
        let root = match header.root {
            Some(root) => root,
            None => return Ok(None),
        };

        let mut node = ctx.load(root)?;
        let result = node.remove(&ctx, header.height as usize, key)?;
        if result.value.is_none() {
            return Ok(None);
        }

        if result.underflow && node.is_empty() {
            header.height -= 1;
            header.root = if header.height == 0 {
                None
            } else {
                Some(node.child(self.page_size - 1)?)
            };
            ctx.delete(node.recid)?;
            debug!("btree {} shrank to height {}", self.recid, header.height);
        }
        header.size = header.size.checked_sub(1).ok_or_else(|| {
            StorageError::Corruption(format!("btree {} removed an entry while empty", self.recid))
        })?;
        self.store_header(&header)?;
        Ok(result.value)
    }

    pub(crate) fn load_node(&self, recid: Recid) -> StorageResult<Node<K, V>> {
        let _guard = self.lock.read();
        self.context().load(recid)
    }

    fn context(&self) -> Context<'_, K, V> {
        Context {
            rm: &self.rm,
            comparator: self.comparator.as_ref(),
            key_serializer: self.key_serializer.as_ref(),
            value_serializer: self.value_serializer.as_ref(),
            page_size: self.page_size,
        }
    }

    fn header(&self) -> StorageResult<TreeHeader> {
        Ok(bincode::deserialize(&self.rm.fetch(self.recid)?)?)
    }

    fn store_header(&self, header: &TreeHeader) -> StorageResult<()> {
        self.rm.update(self.recid, &bincode::serialize(header)?)
    }
}
