//! Durable per-instance key-value storage.
//!
//! Every executor instance gets its own [`KvStore`] from a [`StorageProvider`].
//! Besides plain get/put, stores expose atomic set operations so that
//! subscriber registries are updated by add-if-absent and remove-if-present
//! instead of a load-then-overwrite pair.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::StorageError;
use crate::executor::InstanceKey;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Members of the set stored at `key`; empty if the key is absent.
    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StorageError>;

    /// Add `member` unless already present. Returns whether it was added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    /// Remove each of `members` that is present. Returns how many were removed.
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize, StorageError>;
}

impl dyn KvStore {
    /// Typed read of a JSON value.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Typed write of a JSON value.
    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.put(key, serde_json::to_value(value)?).await
    }
}

/// Hands out the store belonging to an instance.
///
/// Opening the same key twice must yield the same underlying data.
pub trait StorageProvider: Send + Sync {
    fn open(&self, instance: &InstanceKey) -> Arc<dyn KvStore>;
}

/// In-memory store. Sets are kept as JSON arrays of strings.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Value, ahash::RandomState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.data.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StorageError> {
        let Some(entry) = self.data.get(key) else {
            return Ok(BTreeSet::new());
        };
        let Value::Array(items) = entry.value() else {
            return Err(StorageError::NotASet(key.to_owned()));
        };
        Ok(items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_owned))
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut entry = self
            .data
            .entry(key.to_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(items) = entry.value_mut() else {
            return Err(StorageError::NotASet(key.to_owned()));
        };
        if items.iter().any(|item| item.as_str() == Some(member)) {
            return Ok(false);
        }
        items.push(Value::String(member.to_owned()));
        Ok(true)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize, StorageError> {
        let removed = {
            let Some(mut entry) = self.data.get_mut(key) else {
                return Ok(0);
            };
            let Value::Array(items) = entry.value_mut() else {
                return Err(StorageError::NotASet(key.to_owned()));
            };
            let before = items.len();
            items.retain(|item| !item.as_str().is_some_and(|s| members.iter().any(|m| m == s)));
            before - items.len()
        };

        self.data
            .remove_if(key, |_, value| value.as_array().is_some_and(Vec::is_empty));
        Ok(removed)
    }
}

/// Keeps one [`MemoryStore`] per instance for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryStorageProvider {
    stores: DashMap<InstanceKey, Arc<MemoryStore>, ahash::RandomState>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn open(&self, instance: &InstanceKey) -> Arc<dyn KvStore> {
        let store = Arc::clone(self.stores.entry(instance.clone()).or_default().value());
        store
    }
}
