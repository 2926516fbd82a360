use crate::storage::error::StorageResult;

/// Observer of entry changes in a tree, e.g. to keep a secondary index in
/// step. Called after the change is stored and before the tree call returns.
pub trait RecordListener<K, V>: Send + Sync {
    fn inserted(&self, _key: &K, _value: &V) -> StorageResult<()> {
        Ok(())
    }

    fn updated(&self, _key: &K, _old: &V, _new: &V) -> StorageResult<()> {
        Ok(())
    }

    fn removed(&self, _key: &K, _value: &V) -> StorageResult<()> {
        Ok(())
    }
}
