pub mod access;
pub mod config;
pub mod record_manager;
pub mod storage;

pub use access::{BTree, Comparator, Cursor, NaturalOrder, RecordListener, Serializer};
pub use config::StoreConfig;
pub use record_manager::{DefragSummary, RecordManager, StoreStats, VerifyReport};
pub use storage::{Recid, StorageError, StorageResult, TxnState};
