//! Transaction log record format.
//!
//! ```text
//! block image:   [tag u8 = 1][block u64][len u32][image ...][crc32 u32]
//! commit marker: [tag u8 = 2][entry count u32][crc32 u32]
//! ```
//!
//! The checksum covers every preceding byte of the same record.

use bytes::{Buf, BufMut, BytesMut};

use crate::storage::page::BlockId;

const BLOCK_IMAGE_TAG: u8 = 1;
const COMMIT_TAG: u8 = 2;
const CRC_SIZE: usize = 4;

/// A single record of the transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// After-image of a block modified by the transaction.
    BlockImage { block: BlockId, image: Vec<u8> },
    /// Marks the transaction complete; `count` is the number of images
    /// preceding it.
    Commit { count: u32 },
}

impl LogRecord {
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        match self {
            LogRecord::BlockImage { block, image } => {
                buf.reserve(1 + 8 + 4 + image.len() + CRC_SIZE);
                buf.put_u8(BLOCK_IMAGE_TAG);
                buf.put_u64_le(block.0);
                buf.put_u32_le(image.len() as u32);
                buf.put_slice(image);
            }
            LogRecord::Commit { count } => {
                buf.put_u8(COMMIT_TAG);
                buf.put_u32_le(*count);
            }
        }
        let crc = crc32fast::hash(&buf[start..]);
        buf.put_u32_le(crc);
    }

    /// Decode the record at the front of `input`. Returns the record and the
    /// number of bytes it occupied, or `None` if the bytes are truncated, carry
    /// an unknown tag or fail the checksum.
    pub fn decode(input: &[u8]) -> Option<(LogRecord, usize)> {
        let mut cursor = input;
        if !cursor.has_remaining() {
            return None;
        }

        let record = match cursor.get_u8() {
            BLOCK_IMAGE_TAG => {
                if cursor.remaining() < 12 {
                    return None;
                }
                let block = BlockId(cursor.get_u64_le());
                let len = cursor.get_u32_le() as usize;
                if cursor.remaining() < len {
                    return None;
                }
                let image = cursor[..len].to_vec();
                cursor.advance(len);
                LogRecord::BlockImage { block, image }
            }
            COMMIT_TAG => {
                if cursor.remaining() < 4 {
                    return None;
                }
                LogRecord::Commit {
                    count: cursor.get_u32_le(),
                }
            }
            _ => return None,
        };

        let body_len = input.len() - cursor.remaining();
        if cursor.remaining() < CRC_SIZE {
            return None;
        }
        let stored = cursor.get_u32_le();
        if crc32fast::hash(&input[..body_len]) != stored {
            return None;
        }
        Some((record, body_len + CRC_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_image_layout() {
        let record = LogRecord::BlockImage {
            block: BlockId(7),
            image: vec![0xAB; 16],
        };
        let mut buf = BytesMut::new();
        record.encode(&mut buf);

        assert_eq!(buf.len(), 1 + 8 + 4 + 16 + 4);
        assert_eq!(buf[0], BLOCK_IMAGE_TAG);
        assert_eq!(&buf[1..9], &7u64.to_le_bytes());

        let (decoded, used) = LogRecord::decode(&buf).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_sequence_decoding() {
        let mut buf = BytesMut::new();
        LogRecord::BlockImage {
            block: BlockId(1),
            image: vec![1, 2, 3],
        }
        .encode(&mut buf);
        LogRecord::Commit { count: 1 }.encode(&mut buf);

        let (first, used) = LogRecord::decode(&buf).unwrap();
        assert!(matches!(first, LogRecord::BlockImage { .. }));
        let (second, rest) = LogRecord::decode(&buf[used..]).unwrap();
        assert_eq!(second, LogRecord::Commit { count: 1 });
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_torn_and_corrupt_records() {
        let mut buf = BytesMut::new();
        LogRecord::BlockImage {
            block: BlockId(2),
            image: vec![9; 32],
        }
        .encode(&mut buf);

        // Truncated anywhere
        for cut in [0, 1, 5, 13, buf.len() - 1] {
            assert!(LogRecord::decode(&buf[..cut]).is_none());
        }

        // Flipped payload byte
        let mut corrupt = buf.to_vec();
        corrupt[20] ^= 0xFF;
        assert!(LogRecord::decode(&corrupt).is_none());

        // Unknown tag
        assert!(LogRecord::decode(&[9, 0, 0, 0, 0]).is_none());
    }
}
