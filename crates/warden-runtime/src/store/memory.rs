//! In-process store, used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::{DurableStore, RangeQuery, StoreError};

#[derive(Debug, Clone)]
struct Record {
    value: Value,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// TTL-aware in-memory store with failure injection.
///
/// Expiry follows the tokio clock so paused-time tests can advance it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Writes that fail before the store "recovers"
    transient_write_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get` and `query` fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every `set`, `insert` and `delete` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` writes, then succeed.
    pub fn fail_next_writes(&self, n: u32) {
        self.transient_write_failures.store(n, Ordering::SeqCst);
    }

    /// Live records, for assertions.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records.lock().values().filter(|r| r.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        let consumed = self
            .transient_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("injected transient failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check_read()?;
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get(key) {
            Some(record) if record.is_live(now) => Ok(Some(record.value.clone())),
            Some(_) => {
                records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_write()?;
        // A TTL past what `Instant` can represent means no expiry
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.records
            .lock()
            .insert(key.to_string(), Record { value, expires_at });
        Ok(())
    }

    async fn insert(&self, key: &str, value: Value) -> Result<bool, StoreError> {
        self.check_write()?;
        let now = Instant::now();
        let mut records = self.records.lock();
        if records.get(key).is_some_and(|r| r.is_live(now)) {
            return Ok(false);
        }
        records.insert(
            key.to_string(),
            Record {
                value,
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_write()?;
        Ok(self.records.lock().remove(key).is_some())
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<Value>, StoreError> {
        self.check_read()?;
        let now = Instant::now();
        let records = self.records.lock();
        let selected = records
            .iter()
            .filter(|(key, record)| key.starts_with(&query.prefix) && record.is_live(now))
            .map(|(_, record)| &record.value);
        Ok(query.apply(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_follows_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set("cache/a/b", json!(1), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("cache/a/b").await.unwrap(), Some(json!(1)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.get("cache/a/b").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_kept() {
        let store = MemoryStore::new();
        store.set("cache/a/b", json!(1), Some(Duration::MAX)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(store.get("cache/a/b").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_insert_is_append_only() {
        let store = MemoryStore::new();
        assert!(store.insert("proposals/1", json!({ "v": 1 })).await.unwrap());
        assert!(!store.insert("proposals/1", json!({ "v": 2 })).await.unwrap());
        assert_eq!(store.get("proposals/1").await.unwrap(), Some(json!({ "v": 1 })));
    }

    #[tokio::test]
    async fn test_query_by_prefix() {
        let store = MemoryStore::new();
        store.set("traces/1", json!({ "user_id": "u1" }), None).await.unwrap();
        store.set("traces/2", json!({ "user_id": "u2" }), None).await.unwrap();
        store.set("skills/x", json!({ "user_id": "u1" }), None).await.unwrap();

        let out = store
            .query(&RangeQuery::prefix("traces/").filter("user_id", "u1"))
            .await
            .unwrap();
        assert_eq!(out, vec![json!({ "user_id": "u1" })]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);
        assert!(store.set("k", json!(1), None).await.is_err());
        assert!(store.set("k", json!(1), None).await.is_err());
        assert!(store.set("k", json!(1), None).await.is_ok());

        store.fail_reads(true);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient());
    }
}
