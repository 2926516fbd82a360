use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::error::{StorageError, StorageResult};

/// Converts keys and values to the bytes stored in tree nodes.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> StorageResult<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> StorageResult<T>;
}

/// Serializer for any serde type, using bincode.
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Serializer<T> for BincodeSerializer<T> {
    fn serialize(&self, value: &T) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Raw byte strings, stored as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> StorageResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 strings, stored as their bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> StorageResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}
