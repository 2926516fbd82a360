use crate::storage::page::{DATA_PAGE_HEADER_SIZE, RECORD_HEADER_SIZE};

/// Slot capacities records are rounded up to.
///
/// 16-byte steps up to 256, 128-byte steps up to 2048, 512-byte steps
/// beyond, topped by the largest slot a data page can hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClasses {
    sizes: Vec<usize>,
}

impl SizeClasses {
    pub fn new(max_chunk: usize) -> Self {
        let small = (16..=256).step_by(16);
        let medium = (384..=2048).step_by(128);
        let large = (2560..).step_by(512);

        let mut sizes: Vec<usize> = small
            .chain(medium)
            .chain(large)
            .take_while(|&size| size < max_chunk)
            .collect();
        sizes.push(max_chunk);
        Self { sizes }
    }

    pub fn for_block_size(block_size: usize) -> Self {
        Self::new(max_chunk(block_size))
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn size(&self, index: usize) -> usize {
        self.sizes[index]
    }

    /// Largest payload a single slot can hold.
    pub fn max_chunk(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    /// Smallest class that holds `len` bytes. Empty payloads use the smallest
    /// class.
    pub fn class_for(&self, len: usize) -> Option<usize> {
        let len = len.max(1);
        match self.sizes.binary_search(&len) {
            Ok(index) => Some(index),
            Err(index) if index < self.sizes.len() => Some(index),
            Err(_) => None,
        }
    }

    /// Largest class that fits in `space` bytes.
    pub fn round_down(&self, space: usize) -> Option<usize> {
        match self.sizes.binary_search(&space) {
            Ok(index) => Some(index),
            Err(0) => None,
            Err(index) => Some(index - 1),
        }
    }

    /// Class whose size is exactly `size`.
    pub fn index_of(&self, size: usize) -> Option<usize> {
        self.sizes.binary_search(&size).ok()
    }
}

/// Largest payload of a single slot for a block size.
pub fn max_chunk(block_size: usize) -> usize {
    block_size - DATA_PAGE_HEADER_SIZE - RECORD_HEADER_SIZE
}
