use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::BlockId;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Raw fixed-size block I/O over one or more backing files.
///
/// Block `n` lives in file `n / max_file_blocks` at offset
/// `(n % max_file_blocks) * block_size`. The first file is `path` itself and
/// file `i > 0` is `path.<i>`.
pub struct BlockStore {
    path: PathBuf,
    block_size: usize,
    max_file_blocks: Option<u64>,
    files: Vec<File>,
}

impl BlockStore {
    pub fn create(path: &Path, block_size: usize, max_file_blocks: Option<u64>) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Stale extension files from an earlier store at the same path.
        let mut index = 1;
        loop {
            let extra = extension_path(path, index);
            if !extra.exists() {
                break;
            }
            fs::remove_file(&extra)?;
            index += 1;
        }

        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            max_file_blocks,
            files: vec![file],
        })
    }

    pub fn open(path: &Path, block_size: usize, max_file_blocks: Option<u64>) -> StorageResult<Self> {
        let mut files = vec![OpenOptions::new().read(true).write(true).open(path)?];

        let mut index = 1;
        loop {
            let extra = extension_path(path, index);
            if !extra.exists() {
                break;
            }
            files.push(OpenOptions::new().read(true).write(true).open(&extra)?);
            index += 1;
        }

        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            max_file_blocks,
            files,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn read_block(&mut self, block: BlockId, buf: &mut [u8]) -> StorageResult<()> {
        self.check_len(buf.len())?;

        let (index, offset) = self.locate(block);
        let block_size = self.block_size as u64;
        let file = match self.files.get_mut(index) {
            Some(file) => file,
            None => return Err(missing_block(block)),
        };
        if offset + block_size > file.metadata()?.len() {
            return Err(missing_block(block));
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_block(&mut self, block: BlockId, data: &[u8]) -> StorageResult<()> {
        self.check_len(data.len())?;

        let (index, offset) = self.locate(block);
        while self.files.len() <= index {
            let next = extension_path(&self.path, self.files.len());
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&next)?;
            self.files.push(file);
        }

        let file = &mut self.files[index];
        let end = offset + self.block_size as u64;
        // Extend file if necessary
        if end > file.metadata()?.len() {
            file.set_len(end)?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Number of blocks in the store. Every file except the last is full.
    pub fn num_blocks(&self) -> StorageResult<u64> {
        let last = self.files.len() - 1;
        let last_blocks = self.files[last].metadata()?.len() / self.block_size as u64;
        let full = match self.max_file_blocks {
            Some(per_file) => last as u64 * per_file,
            None => 0,
        };
        Ok(full + last_blocks)
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        for file in &self.files {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Paths of every backing file, in block order.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        (0..self.files.len())
            .map(|i| extension_path(&self.path, i))
            .collect()
    }

    fn locate(&self, block: BlockId) -> (usize, u64) {
        match self.max_file_blocks {
            Some(per_file) => (
                (block.0 / per_file) as usize,
                (block.0 % per_file) * self.block_size as u64,
            ),
            None => (0, block.0 * self.block_size as u64),
        }
    }

    fn check_len(&self, len: usize) -> StorageResult<()> {
        if len != self.block_size {
            return Err(StorageError::InvalidArgument(format!(
                "buffer size must be the block size ({}), got {}",
                self.block_size, len
            )));
        }
        Ok(())
    }
}

/// Path of backing file `index` for a store rooted at `path`.
pub fn extension_path(path: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Move every backing file of the store at `from` over the store at `to`,
/// removing any surplus extension files of the old store.
pub fn replace_store_files(from: &Path, to: &Path) -> StorageResult<()> {
    let mut index = 0;
    loop {
        let src = extension_path(from, index);
        if !src.exists() {
            break;
        }
        fs::rename(&src, extension_path(to, index))?;
        index += 1;
    }
    loop {
        let stale = extension_path(to, index);
        if !stale.exists() {
            break;
        }
        fs::remove_file(&stale)?;
        index += 1;
    }
    Ok(())
}

fn missing_block(block: BlockId) -> StorageError {
    StorageError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("block {} does not exist", block.0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    const BS: usize = 4096;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let store = BlockStore::create(&file_path, BS, None)?;
            assert_eq!(store.num_blocks()?, 0);
        }

        {
            let store = BlockStore::open(&file_path, BS, None)?;
            assert_eq!(store.num_blocks()?, 0);
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_block() -> Result<()> {
        let dir = tempdir()?;
        let mut store = BlockStore::create(&dir.path().join("test.db"), BS, None)?;

        let mut write_buf = vec![0u8; BS];
        write_buf[0] = 42;
        write_buf[BS - 1] = 24;
        store.write_block(BlockId(0), &write_buf)?;

        let mut read_buf = vec![0u8; BS];
        store.read_block(BlockId(0), &mut read_buf)?;
        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[BS - 1], 24);

        Ok(())
    }

    #[test]
    fn test_read_nonexistent_block() -> Result<()> {
        let dir = tempdir()?;
        let mut store = BlockStore::create(&dir.path().join("test.db"), BS, None)?;

        let mut buf = vec![0u8; BS];
        assert!(store.read_block(BlockId(10), &mut buf).is_err());

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> Result<()> {
        let dir = tempdir()?;
        let mut store = BlockStore::create(&dir.path().join("test.db"), BS, None)?;

        let mut small = vec![0u8; 100];
        assert!(store.read_block(BlockId(0), &mut small).is_err());
        assert!(store.write_block(BlockId(0), &small).is_err());

        Ok(())
    }

    #[test]
    fn test_file_growth() -> Result<()> {
        let dir = tempdir()?;
        let mut store = BlockStore::create(&dir.path().join("test.db"), BS, None)?;

        store.write_block(BlockId(5), &vec![5u8; BS])?;
        assert_eq!(store.num_blocks()?, 6);

        Ok(())
    }

    #[test]
    fn test_multiple_files() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("split.db");

        {
            let mut store = BlockStore::create(&file_path, BS, Some(4))?;
            for i in 0..10u64 {
                store.write_block(BlockId(i), &vec![i as u8; BS])?;
            }
            assert_eq!(store.num_blocks()?, 10);
            assert_eq!(store.file_paths().len(), 3);
        }

        assert!(extension_path(&file_path, 2).exists());

        let mut store = BlockStore::open(&file_path, BS, Some(4))?;
        assert_eq!(store.num_blocks()?, 10);
        let mut buf = vec![0u8; BS];
        for i in 0..10u64 {
            store.read_block(BlockId(i), &mut buf)?;
            assert!(buf.iter().all(|&b| b == i as u8));
        }

        Ok(())
    }

    #[test]
    fn test_create_removes_stale_extension_files() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("split.db");

        {
            let mut store = BlockStore::create(&file_path, BS, Some(2))?;
            for i in 0..5u64 {
                store.write_block(BlockId(i), &vec![1u8; BS])?;
            }
        }

        let store = BlockStore::create(&file_path, BS, Some(2))?;
        assert_eq!(store.num_blocks()?, 0);
        assert!(!extension_path(&file_path, 1).exists());

        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut store = BlockStore::create(&file_path, BS, None)?;
            store.write_block(BlockId(0), &vec![99u8; BS])?;
            store.sync()?;
        }

        let mut store = BlockStore::open(&file_path, BS, None)?;
        let mut buf = vec![0u8; BS];
        store.read_block(BlockId(0), &mut buf)?;
        assert_eq!(buf[0], 99);

        Ok(())
    }
}
