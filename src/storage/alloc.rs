//! Page allocation over per-type page lists.
//!
//! Every block except the header sits on the list of its page type. The
//! `Free` list is the pool: allocation pops its head (or grows the store),
//! freeing pushes onto it. Both are O(1).

use log::debug;

use crate::storage::buffer::BlockBuffer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{expect_type, BlockId, PageHeader, PageHeaderMut, PageType};

pub struct PageAllocator<'a> {
    buf: &'a mut BlockBuffer,
}

impl<'a> PageAllocator<'a> {
    pub fn new(buf: &'a mut BlockBuffer) -> Self {
        Self { buf }
    }

    /// Take a block off the free list (or extend the store), format it as
    /// `page_type` and append it to that type's list.
    pub fn allocate(&mut self, page_type: PageType) -> StorageResult<BlockId> {
        if page_type == PageType::Free || page_type == PageType::Header {
            return Err(StorageError::InvalidArgument(format!(
                "cannot allocate a {} page",
                page_type
            )));
        }

        let head = self.buf.header()?.list_head(PageType::Free);
        let block = if head.is_none() {
            self.buf.append()
        } else {
            self.unlink(head, PageType::Free)?;
            head
        };

        self.buf.write(block)?.init_page(page_type);
        self.link_tail(block, page_type)?;
        debug!("allocated {} page {}", page_type, block);
        Ok(block)
    }

    /// Unlink `block` from the list of `page_type`, wipe it and push it on
    /// the free list.
    pub fn free(&mut self, block: BlockId, page_type: PageType) -> StorageResult<()> {
        if block.is_none() {
            return Err(StorageError::InvalidArgument(
                "the header block cannot be freed".to_string(),
            ));
        }
        expect_type(block, &self.buf.read(block)?, page_type)?;

        self.unlink(block, page_type)?;
        self.buf.write(block)?.init_page(PageType::Free);
        self.push_head(block, PageType::Free)?;
        debug!("freed {} page {}", page_type, block);
        Ok(())
    }

    fn unlink(&mut self, block: BlockId, page_type: PageType) -> StorageResult<()> {
        let (next, prev) = {
            let data = self.buf.read(block)?;
            expect_type(block, &data, page_type)?;
            (data.next(), data.prev())
        };

        if prev.is_none() {
            self.buf.header_mut()?.set_list_head(page_type, next);
        } else {
            self.buf.write(prev)?.set_next(next);
        }
        if next.is_none() {
            self.buf.header_mut()?.set_list_tail(page_type, prev);
        } else {
            self.buf.write(next)?.set_prev(prev);
        }

        let data = self.buf.write(block)?;
        data.set_next(BlockId::NONE);
        data.set_prev(BlockId::NONE);
        Ok(())
    }

    fn link_tail(&mut self, block: BlockId, page_type: PageType) -> StorageResult<()> {
        let tail = self.buf.header()?.list_tail(page_type);
        {
            let data = self.buf.write(block)?;
            data.set_prev(tail);
            data.set_next(BlockId::NONE);
        }
        if tail.is_none() {
            self.buf.header_mut()?.set_list_head(page_type, block);
        } else {
            self.buf.write(tail)?.set_next(block);
        }
        self.buf.header_mut()?.set_list_tail(page_type, block);
        Ok(())
    }

    fn push_head(&mut self, block: BlockId, page_type: PageType) -> StorageResult<()> {
        let head = self.buf.header()?.list_head(page_type);
        {
            let data = self.buf.write(block)?;
            data.set_next(head);
            data.set_prev(BlockId::NONE);
        }
        if head.is_none() {
            self.buf.header_mut()?.set_list_tail(page_type, block);
        } else {
            self.buf.write(head)?.set_prev(block);
        }
        self.buf.header_mut()?.set_list_head(page_type, block);
        Ok(())
    }
}

/// Blocks on the list of `page_type`, head to tail. Fails on a link that
/// leaves the store, a block of the wrong type or a cycle.
pub fn list_blocks(buf: &BlockBuffer, page_type: PageType) -> StorageResult<Vec<BlockId>> {
    let mut blocks = Vec::new();
    let mut current = buf.header()?.list_head(page_type);
    while !current.is_none() {
        if blocks.len() as u64 >= buf.num_blocks() {
            return Err(StorageError::Corruption(format!(
                "{} page list does not terminate",
                page_type
            )));
        }
        let data = buf.read(current)?;
        expect_type(current, &data, page_type)?;
        blocks.push(current);
        current = data.next();
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::BlockStore;
    use crate::storage::page::FileHeader;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    const BS: usize = 4096;

    fn create_buffer() -> Result<(BlockBuffer, TempDir)> {
        let dir = tempdir()?;
        let store = BlockStore::create(&dir.path().join("alloc.db"), BS, None)?;
        let mut buf = BlockBuffer::new(store, None, false)?;
        let header = buf.append();
        FileHeader::init(buf.write(header)?, 4);
        Ok((buf, dir))
    }

    #[test]
    fn test_allocate_extends_store() -> Result<()> {
        let (mut buf, _dir) = create_buffer()?;
        let mut alloc = PageAllocator::new(&mut buf);

        let a = alloc.allocate(PageType::Data)?;
        let b = alloc.allocate(PageType::Data)?;
        let c = alloc.allocate(PageType::Translation)?;
        assert_eq!((a, b, c), (BlockId(1), BlockId(2), BlockId(3)));

        assert_eq!(list_blocks(&buf, PageType::Data)?, vec![a, b]);
        assert_eq!(list_blocks(&buf, PageType::Translation)?, vec![c]);
        assert_eq!(buf.read(b)?.prev(), a);
        assert_eq!(buf.header()?.list_tail(PageType::Data), b);
        Ok(())
    }

    #[test]
    fn test_free_and_reuse() -> Result<()> {
        let (mut buf, _dir) = create_buffer()?;
        let (a, b, c) = {
            let mut alloc = PageAllocator::new(&mut buf);
            let a = alloc.allocate(PageType::Data)?;
            let b = alloc.allocate(PageType::Data)?;
            let c = alloc.allocate(PageType::Data)?;
            alloc.free(b, PageType::Data)?;
            (a, b, c)
        };

        assert_eq!(list_blocks(&buf, PageType::Data)?, vec![a, c]);
        assert_eq!(list_blocks(&buf, PageType::Free)?, vec![b]);
        assert_eq!(buf.read(c)?.prev(), a);
        assert_eq!(buf.read(b)?.page_type(), Some(PageType::Free));

        let reused = PageAllocator::new(&mut buf).allocate(PageType::FreeSlots)?;
        assert_eq!(reused, b);
        assert_eq!(buf.num_blocks(), 4);
        assert!(list_blocks(&buf, PageType::Free)?.is_empty());
        assert_eq!(list_blocks(&buf, PageType::FreeSlots)?, vec![b]);
        Ok(())
    }

    #[test]
    fn test_free_checks_type() -> Result<()> {
        let (mut buf, _dir) = create_buffer()?;
        let mut alloc = PageAllocator::new(&mut buf);
        let block = alloc.allocate(PageType::Data)?;

        assert!(matches!(
            alloc.free(block, PageType::Translation),
            Err(StorageError::Corruption(_))
        ));
        assert!(alloc.free(BlockId::NONE, PageType::Data).is_err());
        assert!(alloc.allocate(PageType::Header).is_err());
        Ok(())
    }

    #[test]
    fn test_list_cycle_is_detected() -> Result<()> {
        let (mut buf, _dir) = create_buffer()?;
        let (a, b) = {
            let mut alloc = PageAllocator::new(&mut buf);
            (alloc.allocate(PageType::Data)?, alloc.allocate(PageType::Data)?)
        };
        buf.write(b)?.set_next(a);

        assert!(matches!(
            list_blocks(&buf, PageType::Data),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }
}
