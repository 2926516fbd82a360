use std::collections::BTreeSet;

use crate::storage::alloc::PageAllocator;
use crate::storage::buffer::BlockBuffer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{expect_type, BlockId, Location, PageType, SlotPage};

/// Free record slots, one chain of FreeSlots pages per size class. Chain
/// heads live in the file header.
pub struct FreeSlotRegistry<'a> {
    buf: &'a mut BlockBuffer,
}

impl<'a> FreeSlotRegistry<'a> {
    pub fn new(buf: &'a mut BlockBuffer) -> Self {
        Self { buf }
    }

    pub fn push(&mut self, class_index: usize, location: Location) -> StorageResult<()> {
        let head = self.buf.header()?.class_head(class_index);
        if !head.is_none() {
            let data = self.buf.write(head)?;
            expect_type(head, data, PageType::FreeSlots)?;
            if SlotPage::from_data(data).push(location) {
                return Ok(());
            }
        }

        let block = PageAllocator::new(self.buf).allocate(PageType::FreeSlots)?;
        let mut page = SlotPage::init(self.buf.write(block)?, class_index);
        page.set_next_in_class(head);
        page.push(location);
        self.buf.header_mut()?.set_class_head(class_index, block);
        Ok(())
    }

    pub fn pop(&mut self, class_index: usize) -> StorageResult<Option<Location>> {
        loop {
            let head = self.buf.header()?.class_head(class_index);
            if head.is_none() {
                return Ok(None);
            }

            let (location, emptied, next) = {
                let data = self.buf.write(head)?;
                expect_type(head, data, PageType::FreeSlots)?;
                let mut page = SlotPage::from_data(data);
                if page.class_index() != class_index {
                    return Err(StorageError::Corruption(format!(
                        "free-slot page {} belongs to class {}, found on chain {}",
                        head,
                        page.class_index(),
                        class_index
                    )));
                }
                let location = page.pop();
                (location, page.count() == 0, page.next_in_class())
            };

            if emptied {
                self.buf.header_mut()?.set_class_head(class_index, next);
                PageAllocator::new(self.buf).free(head, PageType::FreeSlots)?;
            }
            if let Some(location) = location {
                return Ok(Some(location));
            }
        }
    }

    /// Pop a slot from the smallest non-empty class at or above `class_index`.
    pub fn take_at_least(&mut self, class_index: usize) -> StorageResult<Option<Location>> {
        let class_count = self.buf.header()?.class_count();
        for index in class_index..class_count {
            if let Some(location) = self.pop(index)? {
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    /// Remove every entry pointing into `block` from the chains of the given
    /// classes. Pages left empty are released.
    pub fn purge(&mut self, block: BlockId, classes: &BTreeSet<usize>) -> StorageResult<usize> {
        let mut removed = 0;
        for &class_index in classes {
            let mut prev = BlockId::NONE;
            let mut current = self.buf.header()?.class_head(class_index);
            let mut steps = 0u64;
            while !current.is_none() {
                steps += 1;
                if steps > self.buf.num_blocks() {
                    return Err(chain_cycle(class_index));
                }

                let (count, emptied, next) = {
                    let data = self.buf.write(current)?;
                    expect_type(current, data, PageType::FreeSlots)?;
                    let mut page = SlotPage::from_data(data);
                    let count = page.remove_block(block);
                    (count, page.count() == 0, page.next_in_class())
                };
                removed += count;

                if emptied {
                    if prev.is_none() {
                        self.buf.header_mut()?.set_class_head(class_index, next);
                    } else {
                        SlotPage::from_data(self.buf.write(prev)?).set_next_in_class(next);
                    }
                    PageAllocator::new(self.buf).free(current, PageType::FreeSlots)?;
                } else {
                    prev = current;
                }
                current = next;
            }
        }
        Ok(removed)
    }
}

/// Pages on the chain of one size class, head first.
pub fn class_chain(buf: &BlockBuffer, class_index: usize) -> StorageResult<Vec<BlockId>> {
    let mut pages = Vec::new();
    let mut current = buf.header()?.class_head(class_index);
    while !current.is_none() {
        if pages.len() as u64 >= buf.num_blocks() {
            return Err(chain_cycle(class_index));
        }
        let data = buf.read(current)?;
        expect_type(current, &data, PageType::FreeSlots)?;
        pages.push(current);
        current = SlotPage::from_data(&*data).next_in_class();
    }
    Ok(pages)
}

/// Every registered free slot with its class.
pub fn registered_slots(buf: &BlockBuffer) -> StorageResult<Vec<(usize, Location)>> {
    let mut slots = Vec::new();
    for class_index in 0..buf.header()?.class_count() {
        for block in class_chain(buf, class_index)? {
            let data = buf.read(block)?;
            let page = SlotPage::from_data(&*data);
            slots.extend(page.entries().map(|location| (class_index, location)));
        }
    }
    Ok(slots)
}

fn chain_cycle(class_index: usize) -> StorageError {
    StorageError::Corruption(format!(
        "free-slot chain of class {} does not terminate",
        class_index
    ))
}
