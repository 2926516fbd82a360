//! File header page (block 0).
//!
//! Layout after the common page header:
//!
//! ```text
//! 24   magic u32            28  version u16
//! 32   block_size u32       36  max_file_blocks u32 (0 = one file)
//! 40   list roots: 5 x (head u64, tail u64)
//! 120  root slots: 16 x u64
//! 248  named-object directory recid u64
//! 256  current append data page u64
//! 264  logical id high-water mark u64
//! 272  size class count u32
//! 280  free-slot chain heads: one u64 per size class
//! ```

use byteorder::{ByteOrder, LittleEndian};

use super::{BlockId, PageHeaderMut, PageType};
use crate::storage::error::{StorageError, StorageResult};

pub const HEADER_MAGIC: u32 = 0x424C_4B44;
pub const HEADER_VERSION: u16 = 1;

/// Number of named root slots available to callers.
pub const ROOT_SLOTS: usize = 16;

const MAGIC_OFFSET: usize = 24;
const VERSION_OFFSET: usize = 28;
const BLOCK_SIZE_OFFSET: usize = 32;
const MAX_FILE_BLOCKS_OFFSET: usize = 36;
const LISTS_OFFSET: usize = 40;
const ROOTS_OFFSET: usize = 120;
const NAME_DIRECTORY_OFFSET: usize = 248;
const APPEND_PAGE_OFFSET: usize = 256;
const HIGH_WATER_OFFSET: usize = 264;
const CLASS_COUNT_OFFSET: usize = 272;
const CLASS_HEADS_OFFSET: usize = 280;

/// Number of leading bytes needed to learn the geometry of a store.
pub const PROBE_LEN: usize = CLASS_HEADS_OFFSET;

/// Block size and file split of a store, fixed when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub max_file_blocks: Option<u64>,
}

fn decode_max_file_blocks(raw: u32) -> Option<u64> {
    Some(raw as u64).filter(|&blocks| blocks != 0)
}

pub struct FileHeader<B> {
    data: B,
}

impl<B: AsRef<[u8]>> FileHeader<B> {
    pub fn from_data(data: B) -> Self {
        Self { data }
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn magic(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes()[MAGIC_OFFSET..])
    }

    pub fn version(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes()[VERSION_OFFSET..])
    }

    pub fn block_size(&self) -> usize {
        LittleEndian::read_u32(&self.bytes()[BLOCK_SIZE_OFFSET..]) as usize
    }

    pub fn max_file_blocks(&self) -> Option<u64> {
        decode_max_file_blocks(LittleEndian::read_u32(&self.bytes()[MAX_FILE_BLOCKS_OFFSET..]))
    }

    pub fn list_head(&self, page_type: PageType) -> BlockId {
        let offset = LISTS_OFFSET + page_type.list_index() * 16;
        BlockId(LittleEndian::read_u64(&self.bytes()[offset..]))
    }

    pub fn list_tail(&self, page_type: PageType) -> BlockId {
        let offset = LISTS_OFFSET + page_type.list_index() * 16 + 8;
        BlockId(LittleEndian::read_u64(&self.bytes()[offset..]))
    }

    pub fn root(&self, slot: usize) -> u64 {
        LittleEndian::read_u64(&self.bytes()[ROOTS_OFFSET + slot * 8..])
    }

    pub fn name_directory(&self) -> u64 {
        LittleEndian::read_u64(&self.bytes()[NAME_DIRECTORY_OFFSET..])
    }

    pub fn append_page(&self) -> BlockId {
        BlockId(LittleEndian::read_u64(&self.bytes()[APPEND_PAGE_OFFSET..]))
    }

    pub fn high_water(&self) -> u64 {
        LittleEndian::read_u64(&self.bytes()[HIGH_WATER_OFFSET..])
    }

    pub fn class_count(&self) -> usize {
        LittleEndian::read_u32(&self.bytes()[CLASS_COUNT_OFFSET..]) as usize
    }

    pub fn class_head(&self, class_index: usize) -> BlockId {
        BlockId(LittleEndian::read_u64(
            &self.bytes()[CLASS_HEADS_OFFSET + class_index * 8..],
        ))
    }

    /// Check magic, version and recorded geometry.
    pub fn validate(&self, expected_classes: usize) -> StorageResult<()> {
        if self.magic() != HEADER_MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad header magic {:#x}",
                self.magic()
            )));
        }
        if self.version() != HEADER_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported format version {}",
                self.version()
            )));
        }
        if self.block_size() != self.bytes().len() {
            return Err(StorageError::Corruption(format!(
                "header records block size {} but blocks are {} bytes",
                self.block_size(),
                self.bytes().len()
            )));
        }
        if self.class_count() != expected_classes {
            return Err(StorageError::Corruption(format!(
                "header records {} size classes, expected {}",
                self.class_count(),
                expected_classes
            )));
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FileHeader<B> {
    /// Format a fresh header into `data`.
    pub fn init(mut data: B, class_count: usize) -> Self {
        let block_size = data.as_ref().len();
        {
            let bytes = data.as_mut();
            bytes.init_page(PageType::Header);
            LittleEndian::write_u32(&mut bytes[MAGIC_OFFSET..], HEADER_MAGIC);
            LittleEndian::write_u16(&mut bytes[VERSION_OFFSET..], HEADER_VERSION);
            LittleEndian::write_u32(&mut bytes[BLOCK_SIZE_OFFSET..], block_size as u32);
            LittleEndian::write_u32(&mut bytes[CLASS_COUNT_OFFSET..], class_count as u32);
        }
        Self { data }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Record the file split. Only meaningful before the first block past
    /// the header is written.
    pub fn set_max_file_blocks(&mut self, blocks: Option<u64>) -> StorageResult<()> {
        let raw = match blocks {
            None => 0,
            Some(blocks) => u32::try_from(blocks).ok().filter(|&b| b != 0).ok_or_else(|| {
                StorageError::Config(format!("max_file_blocks {} does not fit the header", blocks))
            })?,
        };
        LittleEndian::write_u32(&mut self.bytes_mut()[MAX_FILE_BLOCKS_OFFSET..], raw);
        Ok(())
    }

    pub fn set_list_head(&mut self, page_type: PageType, block: BlockId) {
        let offset = LISTS_OFFSET + page_type.list_index() * 16;
        LittleEndian::write_u64(&mut self.bytes_mut()[offset..], block.0);
    }

    pub fn set_list_tail(&mut self, page_type: PageType, block: BlockId) {
        let offset = LISTS_OFFSET + page_type.list_index() * 16 + 8;
        LittleEndian::write_u64(&mut self.bytes_mut()[offset..], block.0);
    }

    pub fn set_root(&mut self, slot: usize, value: u64) {
        LittleEndian::write_u64(&mut self.bytes_mut()[ROOTS_OFFSET + slot * 8..], value);
    }

    pub fn set_name_directory(&mut self, recid: u64) {
        LittleEndian::write_u64(&mut self.bytes_mut()[NAME_DIRECTORY_OFFSET..], recid);
    }

    pub fn set_append_page(&mut self, block: BlockId) {
        LittleEndian::write_u64(&mut self.bytes_mut()[APPEND_PAGE_OFFSET..], block.0);
    }

    pub fn set_high_water(&mut self, value: u64) {
        LittleEndian::write_u64(&mut self.bytes_mut()[HIGH_WATER_OFFSET..], value);
    }

    pub fn set_class_head(&mut self, class_index: usize, block: BlockId) {
        LittleEndian::write_u64(
            &mut self.bytes_mut()[CLASS_HEADS_OFFSET + class_index * 8..],
            block.0,
        );
    }
}

/// Read the geometry out of the leading bytes of a store file.
pub fn probe_geometry(prefix: &[u8]) -> StorageResult<Geometry> {
    if prefix.len() < PROBE_LEN {
        return Err(StorageError::Corruption(
            "file is too short to hold a header".to_string(),
        ));
    }
    let magic = LittleEndian::read_u32(&prefix[MAGIC_OFFSET..]);
    if magic != HEADER_MAGIC {
        return Err(StorageError::Corruption(format!(
            "bad header magic {:#x}",
            magic
        )));
    }
    Ok(Geometry {
        block_size: LittleEndian::read_u32(&prefix[BLOCK_SIZE_OFFSET..]) as usize,
        max_file_blocks: decode_max_file_blocks(LittleEndian::read_u32(
            &prefix[MAX_FILE_BLOCKS_OFFSET..],
        )),
    })
}

/// Highest number of size classes a header of this block size can track.
pub fn max_class_slots(block_size: usize) -> usize {
    (block_size - CLASS_HEADS_OFFSET) / 8
}
