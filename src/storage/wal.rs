//! Write-ahead transaction log.
//!
//! Block-level redo logging: a commit first writes the after-image of every
//! changed block plus a checksummed commit marker to the log, then copies the
//! images into the store. Opening a store replays a complete transaction left
//! in the log and discards an incomplete one.

pub mod log_file;
pub mod record;

pub use log_file::{LogContents, TransactionLog};
pub use record::LogRecord;
