//! Typed page views over raw blocks.
//!
//! Every block starts with a 24-byte page header:
//!
//! ```text
//! +---------+------------+-----------+-----------+
//! | type u8 | reserved 7 | next u64  | prev u64  |
//! +---------+------------+-----------+-----------+
//! ```
//!
//! `next`/`prev` link the block into the list of its page type. The list
//! roots live in the file header (block 0).

pub mod data_page;
pub mod header;
pub mod id_page;
pub mod slot_page;
pub mod translation_page;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::error::{StorageError, StorageResult};

pub use data_page::{DataPage, RecordHeader, SlotStatus, DATA_PAGE_HEADER_SIZE, RECORD_HEADER_SIZE};
pub use header::{FileHeader, HEADER_MAGIC, ROOT_SLOTS};
pub use id_page::IdPage;
pub use slot_page::SlotPage;
pub use translation_page::TranslationPage;

pub const PAGE_HEADER_SIZE: usize = 24;
const TYPE_OFFSET: usize = 0;
const NEXT_OFFSET: usize = 8;
const PREV_OFFSET: usize = 16;

/// Block number within the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Block 0 is the file header, so it doubles as the "no block" marker in
    /// list links.
    pub const NONE: BlockId = BlockId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Page types. Each list-managed type owns one doubly-linked page list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    Free = 1,
    Data = 2,
    Translation = 3,
    FreeLogicalIds = 4,
    FreeSlots = 5,
    Header = 6,
}

impl PageType {
    /// Types that own a page list in the file header, in root order.
    pub const LISTED: [PageType; 5] = [
        PageType::Free,
        PageType::Data,
        PageType::Translation,
        PageType::FreeLogicalIds,
        PageType::FreeSlots,
    ];

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PageType::Free),
            2 => Some(PageType::Data),
            3 => Some(PageType::Translation),
            4 => Some(PageType::FreeLogicalIds),
            5 => Some(PageType::FreeSlots),
            6 => Some(PageType::Header),
            _ => None,
        }
    }

    /// Index of this type's list root in the file header.
    pub fn list_index(self) -> usize {
        debug_assert!(self != PageType::Header);
        self as usize - 1
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageType::Free => "free",
            PageType::Data => "data",
            PageType::Translation => "translation",
            PageType::FreeLogicalIds => "free-logical-ids",
            PageType::FreeSlots => "free-slots",
            PageType::Header => "header",
        };
        f.write_str(name)
    }
}

/// Physical location of a record slot: `(block, offset)` packed into a u64
/// as `block << 16 | offset`. Zero means "no location".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location(pub u64);

impl Location {
    pub const NONE: Location = Location(0);

    pub fn new(block: BlockId, offset: u16) -> Self {
        Location((block.0 << 16) | offset as u64)
    }

    pub fn block(&self) -> BlockId {
        BlockId(self.0 >> 16)
    }

    pub fn offset(&self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.block(), self.offset())
    }
}

/// Accessors for the common page header. Implemented for any byte buffer.
pub trait PageHeader {
    fn page_type_tag(&self) -> u8;
    fn next(&self) -> BlockId;
    fn prev(&self) -> BlockId;

    fn page_type(&self) -> Option<PageType> {
        PageType::from_u8(self.page_type_tag())
    }
}

pub trait PageHeaderMut: PageHeader {
    fn set_page_type(&mut self, page_type: PageType);
    fn set_next(&mut self, next: BlockId);
    fn set_prev(&mut self, prev: BlockId);

    /// Zero the block and stamp a fresh header of the given type.
    fn init_page(&mut self, page_type: PageType);

    /// Zero everything after the page header and set the type, keeping the
    /// list links.
    fn reset_body(&mut self, page_type: PageType);
}

impl PageHeader for [u8] {
    fn page_type_tag(&self) -> u8 {
        self[TYPE_OFFSET]
    }

    fn next(&self) -> BlockId {
        BlockId(LittleEndian::read_u64(&self[NEXT_OFFSET..]))
    }

    fn prev(&self) -> BlockId {
        BlockId(LittleEndian::read_u64(&self[PREV_OFFSET..]))
    }
}

impl PageHeaderMut for [u8] {
    fn set_page_type(&mut self, page_type: PageType) {
        self[TYPE_OFFSET] = page_type as u8;
    }

    fn set_next(&mut self, next: BlockId) {
        LittleEndian::write_u64(&mut self[NEXT_OFFSET..], next.0);
    }

    fn set_prev(&mut self, prev: BlockId) {
        LittleEndian::write_u64(&mut self[PREV_OFFSET..], prev.0);
    }

    fn init_page(&mut self, page_type: PageType) {
        self.fill(0);
        self.set_page_type(page_type);
    }

    fn reset_body(&mut self, page_type: PageType) {
        self[PAGE_HEADER_SIZE..].fill(0);
        self.set_page_type(page_type);
    }
}

/// Fail with a corruption error unless the block carries the expected type.
pub fn expect_type(block: BlockId, data: &[u8], expected: PageType) -> StorageResult<()> {
    match data.page_type() {
        Some(actual) if actual == expected => Ok(()),
        actual => Err(StorageError::Corruption(format!(
            "block {} should be a {} page, found {}",
            block,
            expected,
            actual.map_or_else(|| format!("tag {}", data.page_type_tag()), |t| t.to_string())
        ))),
    }
}
