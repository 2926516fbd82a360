use byteorder::{ByteOrder, LittleEndian};

use super::{BlockId, Location, PageHeaderMut, PageType, PAGE_HEADER_SIZE};

const CLASS_INDEX_OFFSET: usize = PAGE_HEADER_SIZE;
const COUNT_OFFSET: usize = PAGE_HEADER_SIZE + 2;
const NEXT_IN_CLASS_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const ENTRIES_OFFSET: usize = PAGE_HEADER_SIZE + 16;

/// One page of a size class's free-slot chain. Pages of the same class are
/// linked through `next_in_class`; the page list links (`next`/`prev`) only
/// tie the page into the FreeSlots list.
pub struct SlotPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> SlotPage<B> {
    pub fn from_data(data: B) -> Self {
        Self { data }
    }

    pub fn capacity(block_size: usize) -> usize {
        (block_size - ENTRIES_OFFSET) / 8
    }

    pub fn class_index(&self) -> usize {
        LittleEndian::read_u16(&self.data.as_ref()[CLASS_INDEX_OFFSET..]) as usize
    }

    pub fn count(&self) -> usize {
        LittleEndian::read_u16(&self.data.as_ref()[COUNT_OFFSET..]) as usize
    }

    pub fn is_full(&self) -> bool {
        self.count() >= Self::capacity(self.data.as_ref().len())
    }

    pub fn next_in_class(&self) -> BlockId {
        BlockId(LittleEndian::read_u64(
            &self.data.as_ref()[NEXT_IN_CLASS_OFFSET..],
        ))
    }

    pub fn get(&self, index: usize) -> Location {
        Location(LittleEndian::read_u64(
            &self.data.as_ref()[ENTRIES_OFFSET + index * 8..],
        ))
    }

    pub fn entries(&self) -> impl Iterator<Item = Location> + '_ {
        (0..self.count()).map(move |i| self.get(i))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlotPage<B> {
    pub fn init(mut data: B, class_index: usize) -> Self {
        data.as_mut().reset_body(PageType::FreeSlots);
        LittleEndian::write_u16(
            &mut data.as_mut()[CLASS_INDEX_OFFSET..],
            class_index as u16,
        );
        Self { data }
    }

    fn set_count(&mut self, count: usize) {
        LittleEndian::write_u16(&mut self.data.as_mut()[COUNT_OFFSET..], count as u16);
    }

    fn set(&mut self, index: usize, location: Location) {
        LittleEndian::write_u64(
            &mut self.data.as_mut()[ENTRIES_OFFSET + index * 8..],
            location.0,
        );
    }

    pub fn set_next_in_class(&mut self, next: BlockId) {
        LittleEndian::write_u64(&mut self.data.as_mut()[NEXT_IN_CLASS_OFFSET..], next.0);
    }

    /// Returns false when the page is full.
    pub fn push(&mut self, location: Location) -> bool {
        if self.is_full() {
            return false;
        }
        let count = self.count();
        self.set(count, location);
        self.set_count(count + 1);
        true
    }

    pub fn pop(&mut self) -> Option<Location> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let location = self.get(count - 1);
        self.set(count - 1, Location::NONE);
        self.set_count(count - 1);
        Some(location)
    }

    /// Drop every entry that points into `block`. Returns how many were removed.
    pub fn remove_block(&mut self, block: BlockId) -> usize {
        let kept: Vec<Location> = self.entries().filter(|loc| loc.block() != block).collect();
        let removed = self.count() - kept.len();
        if removed > 0 {
            for index in kept.len()..self.count() {
                self.set(index, Location::NONE);
            }
            for (index, location) in kept.iter().enumerate() {
                self.set(index, *location);
            }
            self.set_count(kept.len());
        }
        removed
    }
}
