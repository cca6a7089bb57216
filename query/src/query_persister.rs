use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{BoxError, QueryError, QueryResult};

/// Persisted envelope of a query's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQuery {
    /// Serialized value.
    pub data: serde_json::Value,
    /// When the value was fetched, in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Format version. Entries with another version are ignored.
    pub version: u32,
}

/// Durable storage for query data and the offline mutation queue.
///
/// Failures are logged by the caller and treated as a cache miss.
#[async_trait]
pub trait QueryPersister: Send + Sync {
    /// Retrieve an entry.
    async fn read(&self, key: &str) -> Result<Option<PersistedQuery>, BoxError>;
    /// Store an entry, replacing any previous one.
    async fn write(&self, key: &str, entry: PersistedQuery) -> Result<(), BoxError>;
    /// Remove an entry.
    async fn delete(&self, key: &str) -> Result<(), BoxError>;
    /// Remove every entry.
    async fn clear(&self) -> Result<(), BoxError>;
}

/// In-memory persister. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    entries: Arc<Mutex<HashMap<String, PersistedQuery>>>,
}

impl MemoryPersister {
    /// Creates an empty persister.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Reads an entry without going through the async interface.
    pub fn get(&self, key: &str) -> Option<PersistedQuery> {
        self.entries.lock().get(key).cloned()
    }
}

#[async_trait]
impl QueryPersister for MemoryPersister {
    async fn read(&self, key: &str) -> Result<Option<PersistedQuery>, BoxError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, entry: PersistedQuery) -> Result<(), BoxError> {
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BoxError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), BoxError> {
        self.entries.lock().clear();
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(
    value: &T,
    timestamp: u64,
    version: u32,
) -> QueryResult<PersistedQuery> {
    let data = serde_json::to_value(value)
        .map_err(|error| QueryError::SerializationFailed(error.to_string()))?;
    Ok(PersistedQuery {
        data,
        timestamp,
        version,
    })
}

pub(crate) fn decode<T: DeserializeOwned>(
    key: &str,
    entry: PersistedQuery,
    version: u32,
) -> QueryResult<(T, u64)> {
    if entry.version != version {
        return Err(QueryError::HydrationFailed {
            key: key.to_string(),
            message: format!("version {} does not match {}", entry.version, version),
        });
    }
    let value = serde_json::from_value(entry.data).map_err(|error| QueryError::HydrationFailed {
        key: key.to_string(),
        message: error.to_string(),
    })?;
    Ok((value, entry.timestamp))
}
