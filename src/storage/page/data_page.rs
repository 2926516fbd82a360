use byteorder::{ByteOrder, LittleEndian};

use super::{BlockId, Location, PageHeaderMut, PageType, PAGE_HEADER_SIZE};
use crate::storage::error::{StorageError, StorageResult};

// Data page header: common page header + free offset (u32) + live count (u16)
pub const DATA_PAGE_HEADER_SIZE: usize = 32;
const FREE_OFFSET_OFFSET: usize = PAGE_HEADER_SIZE;
const LIVE_COUNT_OFFSET: usize = PAGE_HEADER_SIZE + 4;

// Record slot header (16 bytes)
pub const RECORD_HEADER_SIZE: usize = 16;
const STATUS_OFFSET: usize = 0;
const AVAILABLE_OFFSET: usize = 2;
const CURRENT_OFFSET: usize = 4;
const NEXT_CHUNK_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotStatus {
    Free = 0,
    Head = 1,
    Continuation = 2,
}

impl SlotStatus {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SlotStatus::Free),
            1 => Some(SlotStatus::Head),
            2 => Some(SlotStatus::Continuation),
            _ => None,
        }
    }
}

/// Header in front of every record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub status: SlotStatus,
    /// Capacity of the slot (its size class).
    pub available: u16,
    /// Payload bytes currently in use.
    pub current: u16,
    /// Next chunk of a chained record.
    pub next: Location,
}

/// A data page holds record slots packed from the end of the page header up
/// to `free_offset`.
pub struct DataPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> DataPage<B> {
    pub fn from_data(data: B) -> Self {
        Self { data }
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn free_offset(&self) -> usize {
        LittleEndian::read_u32(&self.bytes()[FREE_OFFSET_OFFSET..]) as usize
    }

    pub fn live_count(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes()[LIVE_COUNT_OFFSET..])
    }

    /// End of the slot area, checked against the page bounds.
    fn used_end(&self, block: BlockId) -> StorageResult<usize> {
        let end = self.free_offset();
        if end < DATA_PAGE_HEADER_SIZE || end > self.bytes().len() {
            return Err(StorageError::Corruption(format!(
                "data page {} has free offset {} outside {}..={}",
                block,
                end,
                DATA_PAGE_HEADER_SIZE,
                self.bytes().len()
            )));
        }
        Ok(end)
    }

    /// Bytes left for new slots (headers included).
    pub fn remaining(&self, block: BlockId) -> StorageResult<usize> {
        let end = self.used_end(block)?;
        Ok(self.bytes().len() - end)
    }

    pub fn can_append(&self, block: BlockId, available: usize) -> StorageResult<bool> {
        Ok(self.remaining(block)? >= RECORD_HEADER_SIZE + available)
    }

    pub fn record_header(&self, block: BlockId, offset: usize) -> StorageResult<RecordHeader> {
        self.check_offset(block, offset)?;
        let raw = &self.bytes()[offset..offset + RECORD_HEADER_SIZE];
        let status = SlotStatus::from_u8(raw[STATUS_OFFSET]).ok_or_else(|| {
            StorageError::Corruption(format!(
                "slot {} has invalid status {}",
                Location::new(block, offset as u16),
                raw[STATUS_OFFSET]
            ))
        })?;
        let header = RecordHeader {
            status,
            available: LittleEndian::read_u16(&raw[AVAILABLE_OFFSET..]),
            current: LittleEndian::read_u16(&raw[CURRENT_OFFSET..]),
            next: Location(LittleEndian::read_u64(&raw[NEXT_CHUNK_OFFSET..])),
        };
        if header.current > header.available
            || offset + RECORD_HEADER_SIZE + header.available as usize > self.free_offset()
        {
            return Err(StorageError::Corruption(format!(
                "slot {} has inconsistent sizes (available {}, current {})",
                Location::new(block, offset as u16),
                header.available,
                header.current
            )));
        }
        Ok(header)
    }

    /// Payload of the slot at `offset`, `len` bytes long.
    pub fn payload(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset + RECORD_HEADER_SIZE;
        &self.bytes()[start..start + len]
    }

    /// Offsets of every slot on the page, in address order.
    pub fn slot_offsets(&self, block: BlockId) -> StorageResult<Vec<usize>> {
        let mut offsets = Vec::new();
        let mut offset = DATA_PAGE_HEADER_SIZE;
        let end = self.used_end(block)?;
        while offset < end {
            let header = self.record_header(block, offset)?;
            offsets.push(offset);
            offset += RECORD_HEADER_SIZE + header.available as usize;
        }
        Ok(offsets)
    }

    fn check_offset(&self, block: BlockId, offset: usize) -> StorageResult<()> {
        let end = self.used_end(block)?;
        if offset < DATA_PAGE_HEADER_SIZE || offset + RECORD_HEADER_SIZE > end {
            return Err(StorageError::Corruption(format!(
                "slot offset {} is outside the used area of data page {}",
                offset, block
            )));
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> DataPage<B> {
    /// Format `data` as an empty data page.
    pub fn init(mut data: B) -> Self {
        data.as_mut().reset_body(PageType::Data);
        let mut page = Self { data };
        page.set_free_offset(DATA_PAGE_HEADER_SIZE);
        page
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    fn set_free_offset(&mut self, offset: usize) {
        LittleEndian::write_u32(&mut self.bytes_mut()[FREE_OFFSET_OFFSET..], offset as u32);
    }

    pub fn set_live_count(&mut self, count: u16) {
        LittleEndian::write_u16(&mut self.bytes_mut()[LIVE_COUNT_OFFSET..], count);
    }

    /// Carve a new free slot of capacity `available` at the end of the used
    /// area. Returns its offset, or `None` if the page is too full.
    pub fn append_slot(&mut self, block: BlockId, available: u16) -> StorageResult<Option<usize>> {
        if !self.can_append(block, available as usize)? {
            return Ok(None);
        }
        let offset = self.free_offset();
        self.set_free_offset(offset + RECORD_HEADER_SIZE + available as usize);
        self.write_record_header(
            offset,
            &RecordHeader {
                status: SlotStatus::Free,
                available,
                current: 0,
                next: Location::NONE,
            },
        );
        Ok(Some(offset))
    }

    pub fn write_record_header(&mut self, offset: usize, header: &RecordHeader) {
        let raw = &mut self.bytes_mut()[offset..offset + RECORD_HEADER_SIZE];
        raw.fill(0);
        raw[STATUS_OFFSET] = header.status as u8;
        LittleEndian::write_u16(&mut raw[AVAILABLE_OFFSET..], header.available);
        LittleEndian::write_u16(&mut raw[CURRENT_OFFSET..], header.current);
        LittleEndian::write_u64(&mut raw[NEXT_CHUNK_OFFSET..], header.next.0);
    }

    pub fn write_payload(&mut self, offset: usize, payload: &[u8]) {
        let start = offset + RECORD_HEADER_SIZE;
        self.bytes_mut()[start..start + payload.len()].copy_from_slice(payload);
    }

    /// Zero `len` payload bytes of the slot at `offset`, starting at `from`.
    pub fn wipe_payload(&mut self, offset: usize, from: usize, len: usize) {
        let start = offset + RECORD_HEADER_SIZE + from;
        self.bytes_mut()[start..start + len].fill(0);
    }

    /// Drop every slot but keep the page type and list links.
    pub fn clear_slots(&mut self) {
        self.bytes_mut()[PAGE_HEADER_SIZE..].fill(0);
        self.set_free_offset(DATA_PAGE_HEADER_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageHeader;

    #[test]
    fn test_init() {
        let page = DataPage::init(vec![0xAAu8; 4096]);
        assert_eq!(page.free_offset(), DATA_PAGE_HEADER_SIZE);
        assert_eq!(page.live_count(), 0);
        assert_eq!(page.remaining(BlockId(1)).unwrap(), 4096 - DATA_PAGE_HEADER_SIZE);
        assert_eq!(page.data.page_type(), Some(PageType::Data));
    }

    #[test]
    fn test_append_and_read_back() {
        let block = BlockId(3);
        let mut page = DataPage::init(vec![0u8; 4096]);

        let first = page.append_slot(block, 32).unwrap().unwrap();
        let second = page.append_slot(block, 16).unwrap().unwrap();
        assert_eq!(first, DATA_PAGE_HEADER_SIZE);
        assert_eq!(second, first + RECORD_HEADER_SIZE + 32);

        page.write_record_header(
            first,
            &RecordHeader {
                status: SlotStatus::Head,
                available: 32,
                current: 5,
                next: Location::new(BlockId(9), 100),
            },
        );
        page.write_payload(first, b"hello");

        let header = page.record_header(block, first).unwrap();
        assert_eq!(header.status, SlotStatus::Head);
        assert_eq!(header.current, 5);
        assert_eq!(header.next, Location::new(BlockId(9), 100));
        assert_eq!(page.payload(first, 5), b"hello");

        let free = page.record_header(block, second).unwrap();
        assert_eq!(free.status, SlotStatus::Free);
        assert_eq!(page.slot_offsets(block).unwrap(), vec![first, second]);
    }

    #[test]
    fn test_append_until_full() {
        let block = BlockId(1);
        let mut page = DataPage::init(vec![0u8; 4096]);
        let max_chunk = 4096 - DATA_PAGE_HEADER_SIZE - RECORD_HEADER_SIZE;
        assert!(page.append_slot(block, max_chunk as u16).unwrap().is_some());
        assert_eq!(page.remaining(block).unwrap(), 0);
        assert!(page.append_slot(block, 16).unwrap().is_none());
    }

    #[test]
    fn test_bad_offsets_are_corruption() {
        let mut page = DataPage::init(vec![0u8; 4096]);
        page.append_slot(BlockId(1), 16).unwrap();
        assert!(matches!(
            page.record_header(BlockId(1), 8),
            Err(StorageError::Corruption(_))
        ));
        assert!(matches!(
            page.record_header(BlockId(1), 2000),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_smashed_free_offset_is_corruption() {
        let block = BlockId(1);
        for bad in [0xFFFF_FFF0u32, 4097, 8] {
            let mut data = vec![0u8; 4096];
            DataPage::init(&mut data[..]).append_slot(block, 64).unwrap();
            LittleEndian::write_u32(&mut data[FREE_OFFSET_OFFSET..], bad);

            let mut page = DataPage::from_data(&mut data[..]);
            assert!(matches!(page.remaining(block), Err(StorageError::Corruption(_))));
            assert!(matches!(page.slot_offsets(block), Err(StorageError::Corruption(_))));
            assert!(matches!(
                page.record_header(block, DATA_PAGE_HEADER_SIZE),
                Err(StorageError::Corruption(_))
            ));
            assert!(matches!(page.append_slot(block, 16), Err(StorageError::Corruption(_))));
        }
    }

    #[test]
    fn test_clear_slots_keeps_links() {
        let mut data = vec![0u8; 4096];
        {
            let mut page = DataPage::init(&mut data[..]);
            page.append_slot(BlockId(1), 64).unwrap();
            page.set_live_count(1);
        }
        data.set_next(BlockId(5));
        let mut page = DataPage::from_data(&mut data[..]);
        page.clear_slots();
        assert_eq!(page.free_offset(), DATA_PAGE_HEADER_SIZE);
        assert_eq!(page.live_count(), 0);
        assert_eq!(data.next(), BlockId(5));
        assert_eq!(data.page_type(), Some(PageType::Data));
    }
}
