//! Paged storage layer.
//!
//! The store is a sequence of fixed-size blocks. Key components, leaves
//! first:
//!
//! - **BlockStore**: raw block I/O over one or more files
//! - **TransactionLog**: redo log of block after-images with a commit marker
//! - **BlockBuffer**: dirty blocks of the open transaction, commit/rollback
//! - **PageAllocator**: per-type page lists rooted in the file header
//! - **PhysicalRecords**: size-classed record slots with free-slot reuse
//! - **LogicalIds**: stable record ids mapped through translation pages

pub mod alloc;
pub mod buffer;
pub mod disk;
pub mod error;
pub mod logical;
pub mod page;
pub mod physical;
pub mod wal;

pub use buffer::{BlockBuffer, TxnState};
pub use disk::BlockStore;
pub use error::{StorageError, StorageResult};
pub use logical::Recid;
pub use page::{BlockId, Location, PageType};
