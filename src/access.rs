//! Access layer built on top of the record manager.
//!
//! - **BTree**: persistent ordered map whose nodes are records
//! - **Cursor**: bidirectional walk over the tree's leaves
//! - **Comparator**: key order used by a tree
//! - **Serializer**: key and value encoding
//! - **RecordListener**: hooks called on every entry change
//!
//! A tree only stores records through [`RecordManager`](crate::RecordManager)
//! and never commits; the caller owns transaction boundaries.

pub mod btree;
pub mod comparator;
pub mod listener;
pub mod serializer;

pub use btree::{BTree, Cursor, DEFAULT_PAGE_SIZE};
pub use comparator::{Comparator, ComparatorFn, NaturalOrder};
pub use listener::RecordListener;
pub use serializer::{BincodeSerializer, BytesSerializer, Serializer, StringSerializer};
