//! Typed persistence layer for USP.
//!
//! The store wraps a [`StorageBackend`] with JSON record codecs, restartable
//! prefix listing, and per-scope write locks. Every mutation of an entity
//! family (a secret path, a transit key name, a database config, a lease)
//! goes through [`Store::lock`] for that scope, which is what makes
//! read-modify-write sequences on one entity linearizable while leaving
//! unrelated entities free to proceed concurrently.
//!
//! The store itself never encrypts: secret-bearing fields inside records are
//! already AEAD blobs by the time they arrive here.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OwnedMutexGuard};

use usp_storage::StorageBackend;

use crate::error::StoreError;

/// A page of keys returned by [`Store::list_page`].
#[derive(Debug, Clone)]
pub struct KeyPage {
    /// Keys in lexicographic order, at most `limit` of them.
    pub keys: Vec<String>,
    /// Opaque cursor to resume after the last returned key, if more remain.
    pub next_cursor: Option<String>,
}

/// Typed, lock-coordinated persistence over a storage backend.
pub struct Store {
    backend: Arc<dyn StorageBackend>,
    /// Per-scope write locks. Grows with the number of distinct entities
    /// mutated over the process lifetime; entries are a pointer-sized mutex.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Store {
    /// Create a new store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the write lock for an entity scope (e.g. `kv:<path>`,
    /// `transit:<name>`, `lease:<id>`).
    ///
    /// The guard is owned so it can be held across await points for the
    /// duration of a read-modify-write sequence.
    pub async fn lock(&self, scope: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(scope.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        entry.lock_owned().await
    }

    /// Read raw bytes by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.backend.get(key).await?)
    }

    /// Write raw bytes. The write is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        Ok(self.backend.put(key, value).await?)
    }

    /// Read and decode a JSON record.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Storage`] if the backend fails.
    /// - [`StoreError::Codec`] if the stored bytes are not valid for `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Codec {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Some(value))
    }

    /// Encode and write a JSON record. Durable when this returns.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Codec`] if `T` fails to serialize.
    /// - [`StoreError::Storage`] if the backend fails.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Codec {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(self.backend.put(key, &bytes).await?)
    }

    /// Delete a key. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        Ok(self.backend.delete(key).await?)
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.backend.exists(key).await?)
    }

    /// List all keys under a prefix, in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.backend.list(prefix).await?)
    }

    /// List one page of keys under a prefix.
    ///
    /// `cursor` is the opaque value returned by a previous page; listing
    /// resumes strictly after it. Listings are restartable — a stale cursor
    /// simply resumes from wherever it points.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn list_page(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<KeyPage, StoreError> {
        let all = self.backend.list(prefix).await?;
        let keys: Vec<String> = all
            .into_iter()
            .filter(|k| cursor.is_none_or(|c| k.as_str() > c))
            .take(limit)
            .collect();
        let next_cursor = if keys.len() == limit {
            keys.last().cloned()
        } else {
            None
        };
        Ok(KeyPage { keys, next_cursor })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use usp_storage::MemoryBackend;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u64,
    }

    fn make_store() -> Store {
        Store::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn json_roundtrip() {
        let store = make_store();
        let record = Record {
            name: "alpha".to_owned(),
            count: 7,
        };
        store.put_json("test/alpha", &record).await.unwrap();
        let loaded: Option<Record> = store.get_json("test/alpha").await.unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn get_json_missing_returns_none() {
        let store = make_store();
        let loaded: Option<Record> = store.get_json("nope").await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn get_json_bad_bytes_is_codec_error() {
        let store = make_store();
        store.put_raw("test/bad", b"not json").await.unwrap();
        let result: Result<Option<Record>, _> = store.get_json("test/bad").await;
        assert!(matches!(result, Err(StoreError::Codec { .. })));
    }

    #[tokio::test]
    async fn list_page_walks_all_keys() {
        let store = make_store();
        for i in 0..7 {
            store.put_raw(&format!("p/{i}"), b"x").await.unwrap();
        }

        let page1 = store.list_page("p/", None, 3).await.unwrap();
        assert_eq!(page1.keys, vec!["p/0", "p/1", "p/2"]);
        let cursor = page1.next_cursor.unwrap();

        let page2 = store.list_page("p/", Some(&cursor), 3).await.unwrap();
        assert_eq!(page2.keys, vec!["p/3", "p/4", "p/5"]);
        let cursor = page2.next_cursor.unwrap();

        let page3 = store.list_page("p/", Some(&cursor), 3).await.unwrap();
        assert_eq!(page3.keys, vec!["p/6"]);
        assert!(page3.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_page_exact_boundary_has_empty_last_page() {
        let store = make_store();
        for i in 0..4 {
            store.put_raw(&format!("p/{i}"), b"x").await.unwrap();
        }
        let page1 = store.list_page("p/", None, 4).await.unwrap();
        assert_eq!(page1.keys.len(), 4);
        let cursor = page1.next_cursor.unwrap();
        let page2 = store.list_page("p/", Some(&cursor), 4).await.unwrap();
        assert!(page2.keys.is_empty());
        assert!(page2.next_cursor.is_none());
    }

    #[tokio::test]
    async fn scope_lock_serializes_writers() {
        let store = Arc::new(make_store());
        store.put_raw("counter", b"0").await.unwrap();

        // Two tasks increment the same counter under the same scope lock;
        // without the lock, the read-modify-write pairs would interleave.
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let _guard = store.lock("counter").await;
                    let raw = store.get_raw("counter").await.unwrap().unwrap();
                    let n: u64 = String::from_utf8(raw).unwrap().parse().unwrap();
                    tokio::time::sleep(Duration::from_micros(10)).await;
                    store
                        .put_raw("counter", (n + 1).to_string().as_bytes())
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let raw = store.get_raw("counter").await.unwrap().unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), "100");
    }

    #[tokio::test]
    async fn different_scopes_do_not_block() {
        let store = make_store();
        let guard_a = store.lock("a").await;
        // A second scope must be acquirable while the first is held.
        let guard_b = store.lock("b").await;
        drop(guard_a);
        drop(guard_b);
    }
}
