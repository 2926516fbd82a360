use byteorder::{ByteOrder, LittleEndian};

use super::{PageHeaderMut, PageType, PAGE_HEADER_SIZE};

const COUNT_OFFSET: usize = PAGE_HEADER_SIZE;
const ENTRIES_OFFSET: usize = PAGE_HEADER_SIZE + 8;

/// Page of released logical ids, used as a stack.
pub struct IdPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> IdPage<B> {
    pub fn from_data(data: B) -> Self {
        Self { data }
    }

    pub fn capacity(block_size: usize) -> usize {
        (block_size - ENTRIES_OFFSET) / 8
    }

    pub fn count(&self) -> usize {
        LittleEndian::read_u32(&self.data.as_ref()[COUNT_OFFSET..]) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.count() >= Self::capacity(self.data.as_ref().len())
    }

    pub fn get(&self, index: usize) -> u64 {
        LittleEndian::read_u64(&self.data.as_ref()[ENTRIES_OFFSET + index * 8..])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> IdPage<B> {
    pub fn init(mut data: B) -> Self {
        data.as_mut().reset_body(PageType::FreeLogicalIds);
        Self { data }
    }

    fn set_count(&mut self, count: usize) {
        LittleEndian::write_u32(&mut self.data.as_mut()[COUNT_OFFSET..], count as u32);
    }

    /// Returns false when the page is full.
    pub fn push(&mut self, id: u64) -> bool {
        if self.is_full() {
            return false;
        }
        let count = self.count();
        LittleEndian::write_u64(&mut self.data.as_mut()[ENTRIES_OFFSET + count * 8..], id);
        self.set_count(count + 1);
        true
    }

    pub fn pop(&mut self) -> Option<u64> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let id = self.get(count - 1);
        LittleEndian::write_u64(&mut self.data.as_mut()[ENTRIES_OFFSET + (count - 1) * 8..], 0);
        self.set_count(count - 1);
        Some(id)
    }
}
