pub mod block_store;

pub use block_store::{extension_path, replace_store_files, BlockStore};
