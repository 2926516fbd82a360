//! Physical record storage.
//!
//! Records live in slots on data pages. A slot's capacity is a size class;
//! freed slots are registered per class and reused before the store grows.
//! Payloads larger than one slot are split into a chain of slots linked
//! through the slot header's `next` location.

pub mod registry;
pub mod size_class;

use std::collections::{BTreeSet, HashSet};

use log::debug;

use crate::storage::alloc::PageAllocator;
use crate::storage::buffer::BlockBuffer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{
    expect_type, BlockId, DataPage, Location, PageType, RecordHeader, SlotStatus,
    RECORD_HEADER_SIZE,
};

pub use registry::{registered_slots, FreeSlotRegistry};
pub use size_class::SizeClasses;

pub struct PhysicalRecords<'a> {
    buf: &'a mut BlockBuffer,
    classes: &'a SizeClasses,
}

impl<'a> PhysicalRecords<'a> {
    pub fn new(buf: &'a mut BlockBuffer, classes: &'a SizeClasses) -> Self {
        Self { buf, classes }
    }

    /// Store `payload` and return the location of its head slot.
    pub fn insert(&mut self, payload: &[u8]) -> StorageResult<Location> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(self.classes.max_chunk()).collect()
        };

        // Last chunk first so every chunk knows its successor
        let mut next = Location::NONE;
        for (index, chunk) in chunks.iter().enumerate().rev() {
            let status = if index == 0 {
                SlotStatus::Head
            } else {
                SlotStatus::Continuation
            };
            let location = self.allocate_slot(chunk.len())?;
            self.fill_slot(location, status, chunk, next)?;
            next = location;
        }
        Ok(next)
    }

    /// Replace the record at `location`. Returns the (possibly new) head
    /// location.
    pub fn update(&mut self, location: Location, payload: &[u8]) -> StorageResult<Location> {
        let head = {
            let data = self.buf.read(location.block())?;
            slot_header(location, &data, SlotStatus::Head)?
        };

        if payload.len() > head.available as usize {
            self.free(location)?;
            return self.insert(payload);
        }

        let old_chain = head.next;
        {
            let data = self.buf.write(location.block())?;
            let mut page = DataPage::from_data(data);
            page.write_record_header(
                location.offset(),
                &RecordHeader {
                    status: SlotStatus::Head,
                    available: head.available,
                    current: payload.len() as u16,
                    next: Location::NONE,
                },
            );
            page.write_payload(location.offset(), payload);
            page.wipe_payload(
                location.offset(),
                payload.len(),
                head.available as usize - payload.len(),
            );
        }
        if !old_chain.is_none() {
            for chunk in chain(self.buf, old_chain, SlotStatus::Continuation)? {
                self.free_slot(chunk)?;
            }
        }
        Ok(location)
    }

    /// Release every slot of the record at `location`.
    pub fn free(&mut self, location: Location) -> StorageResult<()> {
        for chunk in chain(self.buf, location, SlotStatus::Head)? {
            self.free_slot(chunk)?;
        }
        Ok(())
    }

    fn allocate_slot(&mut self, len: usize) -> StorageResult<Location> {
        let class_index = self.classes.class_for(len).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "chunk of {} bytes exceeds the slot limit {}",
                len,
                self.classes.max_chunk()
            ))
        })?;

        if let Some(location) = FreeSlotRegistry::new(self.buf).take_at_least(class_index)? {
            return Ok(location);
        }

        let size = self.classes.size(class_index) as u16;
        let append = self.buf.header()?.append_page();
        if !append.is_none() {
            let data = self.buf.write(append)?;
            expect_type(append, data, PageType::Data)?;
            if let Some(offset) = DataPage::from_data(data).append_slot(append, size)? {
                return Ok(Location::new(append, offset as u16));
            }
            self.retire_append_page(append)?;
        }

        let block = PageAllocator::new(self.buf).allocate(PageType::Data)?;
        let offset = DataPage::init(self.buf.write(block)?)
            .append_slot(block, size)?
            .ok_or_else(|| {
                StorageError::Corruption(format!("fresh data page {} cannot hold a slot", block))
            })?;
        self.buf.header_mut()?.set_append_page(block);
        Ok(Location::new(block, offset as u16))
    }

    /// Stop appending to `block`. Its unused tail becomes a registered free
    /// slot when it is big enough to hold one.
    fn retire_append_page(&mut self, block: BlockId) -> StorageResult<()> {
        let carved = {
            let mut page = DataPage::from_data(self.buf.write(block)?);
            let space = page.remaining(block)?.saturating_sub(RECORD_HEADER_SIZE);
            match self.classes.round_down(space) {
                Some(class_index) => page
                    .append_slot(block, self.classes.size(class_index) as u16)?
                    .map(|offset| (class_index, Location::new(block, offset as u16))),
                None => None,
            }
        };
        if let Some((class_index, location)) = carved {
            FreeSlotRegistry::new(self.buf).push(class_index, location)?;
        }
        self.buf.header_mut()?.set_append_page(BlockId::NONE);
        debug!("retired append page {}", block);
        Ok(())
    }

    fn fill_slot(
        &mut self,
        location: Location,
        status: SlotStatus,
        chunk: &[u8],
        next: Location,
    ) -> StorageResult<()> {
        let block = location.block();
        let data = self.buf.write(block)?;
        expect_type(block, data, PageType::Data)?;
        let mut page = DataPage::from_data(data);
        let header = page.record_header(block, location.offset())?;
        if header.status != SlotStatus::Free || (header.available as usize) < chunk.len() {
            return Err(StorageError::Corruption(format!(
                "slot {} handed out for {} bytes is not a free slot of that size",
                location,
                chunk.len()
            )));
        }

        page.write_record_header(
            location.offset(),
            &RecordHeader {
                status,
                available: header.available,
                current: chunk.len() as u16,
                next,
            },
        );
        page.write_payload(location.offset(), chunk);
        page.set_live_count(page.live_count() + 1);
        Ok(())
    }

    fn free_slot(&mut self, location: Location) -> StorageResult<()> {
        let block = location.block();
        let (class_index, live) = {
            let data = self.buf.write(block)?;
            expect_type(block, data, PageType::Data)?;
            let mut page = DataPage::from_data(data);
            let header = page.record_header(block, location.offset())?;
            let class_index = self
                .classes
                .index_of(header.available as usize)
                .ok_or_else(|| {
                    StorageError::Corruption(format!(
                        "slot {} has capacity {} which is not a size class",
                        location, header.available
                    ))
                })?;
            let live = page.live_count().checked_sub(1).ok_or_else(|| {
                StorageError::Corruption(format!("data page {} has no live records", block))
            })?;

            page.write_record_header(
                location.offset(),
                &RecordHeader {
                    status: SlotStatus::Free,
                    available: header.available,
                    current: 0,
                    next: Location::NONE,
                },
            );
            page.wipe_payload(location.offset(), 0, header.current as usize);
            page.set_live_count(live);
            (class_index, live)
        };

        if live == 0 {
            self.release_page(block)
        } else {
            FreeSlotRegistry::new(self.buf).push(class_index, location)
        }
    }

    /// Called when the last live record of `block` goes away.
    fn release_page(&mut self, block: BlockId) -> StorageResult<()> {
        let classes: BTreeSet<usize> = {
            let data = self.buf.read(block)?;
            let page = DataPage::from_data(&*data);
            let mut classes = BTreeSet::new();
            for offset in page.slot_offsets(block)? {
                let header = page.record_header(block, offset)?;
                if let Some(index) = self.classes.index_of(header.available as usize) {
                    classes.insert(index);
                }
            }
            classes
        };
        FreeSlotRegistry::new(self.buf).purge(block, &classes)?;

        if self.buf.header()?.append_page() == block {
            DataPage::from_data(self.buf.write(block)?).clear_slots();
            debug!("reset empty append page {}", block);
        } else {
            PageAllocator::new(self.buf).free(block, PageType::Data)?;
        }
        Ok(())
    }
}

/// Read the record whose head slot is at `location`.
pub fn fetch(buf: &BlockBuffer, location: Location) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    let mut visited = HashSet::new();
    let mut current = location;
    let mut expected = SlotStatus::Head;
    loop {
        if !visited.insert(current) {
            return Err(chain_cycle(location));
        }
        let data = buf.read(current.block())?;
        let header = slot_header(current, &data, expected)?;
        payload.extend_from_slice(
            DataPage::from_data(&*data).payload(current.offset(), header.current as usize),
        );
        if header.next.is_none() {
            return Ok(payload);
        }
        current = header.next;
        expected = SlotStatus::Continuation;
    }
}

/// Slot locations of the chain starting at `location`.
fn chain(buf: &BlockBuffer, location: Location, first: SlotStatus) -> StorageResult<Vec<Location>> {
    let mut chunks = Vec::new();
    let mut visited = HashSet::new();
    let mut current = location;
    let mut expected = first;
    while !current.is_none() {
        if !visited.insert(current) {
            return Err(chain_cycle(location));
        }
        let header = {
            let data = buf.read(current.block())?;
            slot_header(current, &data, expected)?
        };
        chunks.push(current);
        current = header.next;
        expected = SlotStatus::Continuation;
    }
    Ok(chunks)
}

fn slot_header(location: Location, data: &[u8], expected: SlotStatus) -> StorageResult<RecordHeader> {
    let block = location.block();
    expect_type(block, data, PageType::Data)?;
    let header = DataPage::from_data(data).record_header(block, location.offset())?;
    if header.status != expected {
        return Err(StorageError::Corruption(format!(
            "slot {} should be {:?}, found {:?}",
            location, expected, header.status
        )));
    }
    Ok(header)
}

fn chain_cycle(location: Location) -> StorageError {
    StorageError::Corruption(format!("record chain starting at {} loops", location))
}
