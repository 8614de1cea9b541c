// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Persistent key-value storage abstraction.

The hosting process provides the durable store; the pipeline only sees this
trait. Keys are `/`-separated paths. Listing a prefix yields the key suffixes
under it, sorted, so callers can reconstruct full keys with simple
concatenation.
*/

use {
    crate::error::{PipelineError, Result},
    async_trait::async_trait,
    std::collections::BTreeMap,
    tokio::sync::RwLock,
};

/// Durable key-value store provided by the hosting process.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the suffixes of keys beginning with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// An in-memory [Storage] implementation.
///
/// Used by tests and by embeddings that do not bind a durable store.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect())
    }
}

/// Convenience wrapper attaching the key to storage errors raised by callers.
pub fn storage_error(key: &str, message: impl ToString) -> PipelineError {
    PipelineError::StorageIoKey(key.to_string(), message.to_string())
}
