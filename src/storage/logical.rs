//! Logical record ids.
//!
//! A [`Recid`] names a slot in a translation page; the slot holds the
//! record's current physical location. Records can move without their id
//! changing. For `n` slots per translation page,
//! `recid = ordinal * n + slot + 1`, where `ordinal` is the position of the
//! translation page in its page list.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::alloc::{list_blocks, PageAllocator};
use crate::storage::buffer::BlockBuffer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{expect_type, BlockId, IdPage, Location, PageType, TranslationPage};

/// Stable handle to a stored record. Zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Recid(pub u64);

impl Recid {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Recid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Recid({})", self.0)
    }
}

/// In-memory map from translation page ordinal to block.
#[derive(Debug, Clone)]
pub struct TranslationMap {
    pages: Vec<BlockId>,
    slots_per_page: usize,
}

impl TranslationMap {
    /// Rebuild the map by walking the translation page list.
    pub fn load(buf: &BlockBuffer) -> StorageResult<Self> {
        Ok(Self {
            pages: list_blocks(buf, PageType::Translation)?,
            slots_per_page: TranslationPage::<&[u8]>::slots_per_page(buf.block_size()),
        })
    }

    pub fn pages(&self) -> &[BlockId] {
        &self.pages
    }

    pub fn slots_per_page(&self) -> usize {
        self.slots_per_page
    }

    pub fn recid(&self, ordinal: usize, slot: usize) -> Recid {
        Recid((ordinal * self.slots_per_page + slot) as u64 + 1)
    }

    /// Translation page ordinal and slot of `recid`.
    fn split(&self, recid: Recid) -> StorageResult<(usize, usize)> {
        if !recid.is_valid() {
            return Err(StorageError::InvalidRecid(recid));
        }
        let index = (recid.0 - 1) as usize;
        Ok((index / self.slots_per_page, index % self.slots_per_page))
    }
}

/// Current location of `recid`.
pub fn lookup(buf: &BlockBuffer, map: &TranslationMap, recid: Recid) -> StorageResult<Location> {
    let (ordinal, slot) = map.split(recid)?;
    let block = *map
        .pages
        .get(ordinal)
        .ok_or(StorageError::InvalidRecid(recid))?;
    let data = buf.read(block)?;
    expect_type(block, &data, PageType::Translation)?;
    let location = TranslationPage::from_data(&*data).get(slot);
    if location.is_none() {
        return Err(StorageError::RecordNotFound(recid));
    }
    Ok(location)
}

/// Number of released ids waiting for reuse.
pub fn free_id_count(buf: &BlockBuffer) -> StorageResult<usize> {
    let mut count = 0;
    for block in list_blocks(buf, PageType::FreeLogicalIds)? {
        count += IdPage::from_data(&*buf.read(block)?).count();
    }
    Ok(count)
}

pub struct LogicalIds<'a> {
    buf: &'a mut BlockBuffer,
    map: &'a mut TranslationMap,
}

impl<'a> LogicalIds<'a> {
    pub fn new(buf: &'a mut BlockBuffer, map: &'a mut TranslationMap) -> Self {
        Self { buf, map }
    }

    /// Bind a new id to `location`, reusing a released id when one exists.
    pub fn insert(&mut self, location: Location) -> StorageResult<Recid> {
        let recid = match self.pop_free_id()? {
            Some(recid) => recid,
            None => {
                let high_water = self.buf.header()?.high_water();
                Recid(high_water + 1)
            }
        };
        self.bind(recid, location)?;
        Ok(recid)
    }

    /// Point an existing id at a new location.
    pub fn update(&mut self, recid: Recid, location: Location) -> StorageResult<()> {
        lookup(self.buf, self.map, recid)?;
        let (ordinal, slot) = self.map.split(recid)?;
        let block = self.map.pages[ordinal];
        TranslationPage::from_data(self.buf.write(block)?).set(slot, location);
        Ok(())
    }

    /// Unbind `recid` and queue it for reuse.
    pub fn delete(&mut self, recid: Recid) -> StorageResult<()> {
        lookup(self.buf, self.map, recid)?;
        let (ordinal, slot) = self.map.split(recid)?;
        let block = self.map.pages[ordinal];
        TranslationPage::from_data(self.buf.write(block)?).set(slot, Location::NONE);
        self.release(recid)
    }

    /// Grow the translation pages until there are at least `count` of them.
    pub fn reserve_pages(&mut self, count: usize) -> StorageResult<()> {
        while self.map.pages.len() < count {
            let block = PageAllocator::new(self.buf).allocate(PageType::Translation)?;
            TranslationPage::init(self.buf.write(block)?);
            self.map.pages.push(block);
        }
        Ok(())
    }

    /// Bind a specific unused id, growing the translation pages as needed.
    pub fn bind(&mut self, recid: Recid, location: Location) -> StorageResult<()> {
        let (ordinal, slot) = self.map.split(recid)?;
        self.reserve_pages(ordinal + 1)?;

        let block = self.map.pages[ordinal];
        let mut page = TranslationPage::from_data(self.buf.write(block)?);
        if !page.get(slot).is_none() {
            return Err(StorageError::Corruption(format!(
                "{} is handed out again while still in use",
                recid
            )));
        }
        page.set(slot, location);

        let mut header = self.buf.header_mut()?;
        if recid.0 > header.high_water() {
            header.set_high_water(recid.0);
        }
        Ok(())
    }

    /// Push `recid` on the stack of reusable ids.
    pub fn release(&mut self, recid: Recid) -> StorageResult<()> {
        let tail = self.buf.header()?.list_tail(PageType::FreeLogicalIds);
        if !tail.is_none() {
            let data = self.buf.write(tail)?;
            expect_type(tail, data, PageType::FreeLogicalIds)?;
            if IdPage::from_data(data).push(recid.0) {
                return Ok(());
            }
        }

        let block = PageAllocator::new(self.buf).allocate(PageType::FreeLogicalIds)?;
        IdPage::init(self.buf.write(block)?).push(recid.0);
        Ok(())
    }

    fn pop_free_id(&mut self) -> StorageResult<Option<Recid>> {
        loop {
            let tail = self.buf.header()?.list_tail(PageType::FreeLogicalIds);
            if tail.is_none() {
                return Ok(None);
            }

            let (id, emptied) = {
                let data = self.buf.write(tail)?;
                expect_type(tail, data, PageType::FreeLogicalIds)?;
                let mut page = IdPage::from_data(data);
                let id = page.pop();
                (id, page.is_empty())
            };
            if emptied {
                PageAllocator::new(self.buf).free(tail, PageType::FreeLogicalIds)?;
            }
            if let Some(id) = id {
                return Ok(Some(Recid(id)));
            }
        }
    }
}
