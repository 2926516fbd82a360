//! Transaction log file.
//!
//! The log lives next to the store as `<path>.log` and holds at most one
//! transaction: the after-images of every block it changed, followed by a
//! commit marker. It is truncated once the images reach the store.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use log::debug;

use super::record::LogRecord;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::BlockId;

/// What the log file held when it was read back.
#[derive(Debug, PartialEq, Eq)]
pub enum LogContents {
    Empty,
    /// A complete transaction, ready to replay.
    Committed(Vec<(BlockId, Vec<u8>)>),
    /// Bytes without a valid commit marker (torn write).
    Torn { bytes: u64 },
}

pub struct TransactionLog {
    path: PathBuf,
    file: BufWriter<File>,
    sync_on_commit: bool,
}

impl TransactionLog {
    /// Path of the log belonging to the store at `store_path`.
    pub fn path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path.as_os_str().to_os_string();
        name.push(".log");
        PathBuf::from(name)
    }

    /// Open (or create) the log file without touching its contents.
    pub fn open(path: &Path, sync_on_commit: bool) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.seek(SeekFrom::End(0))?;

        Ok(TransactionLog {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            sync_on_commit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one transaction: every block image, then the commit marker.
    /// The transaction is durable once this returns (when syncing is on).
    pub fn write_transaction<'a, I>(&mut self, images: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = (BlockId, &'a [u8])>,
    {
        let mut buf = BytesMut::new();
        let mut count = 0u32;
        for (block, image) in images {
            LogRecord::BlockImage {
                block,
                image: image.to_vec(),
            }
            .encode(&mut buf);
            count += 1;
        }
        LogRecord::Commit { count }.encode(&mut buf);

        self.file
            .write_all(&buf)
            .and_then(|_| self.file.flush())
            .map_err(|e| StorageError::LogWrite(e.to_string()))?;
        if self.sync_on_commit {
            self.file
                .get_ref()
                .sync_data()
                .map_err(|e| StorageError::LogWrite(e.to_string()))?;
        }
        debug!(
            "logged {} block images ({} bytes) to {}",
            count,
            buf.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read back the log. Only a transaction closed by a valid commit marker
    /// whose count matches the images before it is reported as committed.
    pub fn read(&mut self) -> StorageResult<LogContents> {
        self.file.flush()?;
        let bytes = fs::read(&self.path)?;
        if bytes.is_empty() {
            return Ok(LogContents::Empty);
        }

        let mut images = Vec::new();
        let mut pos = 0;
        while let Some((record, used)) = LogRecord::decode(&bytes[pos..]) {
            pos += used;
            match record {
                LogRecord::BlockImage { block, image } => images.push((block, image)),
                LogRecord::Commit { count } if count as usize == images.len() => {
                    return Ok(LogContents::Committed(images));
                }
                LogRecord::Commit { .. } => break,
            }
        }
        Ok(LogContents::Torn {
            bytes: bytes.len() as u64,
        })
    }

    /// Drop everything in the log.
    pub fn truncate(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        let file = self.file.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        if self.sync_on_commit {
            file.sync_data()?;
        }
        Ok(())
    }
}
