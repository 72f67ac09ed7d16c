//! Single-document JSON file store.
//!
//! The whole store is one JSON object on disk, rewritten on every write via
//! a temp file and rename. Suitable for the CLI and small deployments, not
//! for concurrent processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DurableStore, RangeQuery, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Durable store backed by one JSON file. Expiry uses wall-clock time.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, FileRecord>>,
    /// Serializes file rewrites so an older snapshot never lands last
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open the store, creating an empty one if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), records = records.len(), "Opened JSON file store");
        Ok(Self {
            path,
            records: Mutex::new(records),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` and flush the document. Returns the closure's result.
    async fn write<R>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, FileRecord>) -> R,
    ) -> Result<R, StoreError> {
        let _guard = self.write_lock.lock().await;
        let (result, bytes) = {
            let mut records = self.records.lock();
            let now = Utc::now();
            records.retain(|_, record| record.is_live(now));
            let result = mutate(&mut records);
            (result, serde_json::to_vec_pretty(&*records)?)
        };

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(result)
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self.write(|records| {
            records.insert(key.to_string(), FileRecord { value, expires_at });
        })
        .await
    }

    async fn insert(&self, key: &str, value: Value) -> Result<bool, StoreError> {
        self.write(|records| {
            if records.contains_key(key) {
                return false;
            }
            records.insert(
                key.to_string(),
                FileRecord {
                    value,
                    expires_at: None,
                },
            );
            true
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.write(|records| records.remove(key).is_some()).await
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<Value>, StoreError> {
        let now = Utc::now();
        let records = self.records.lock();
        let selected = records
            .range(query.prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&query.prefix))
            .filter(|(_, record)| record.is_live(now))
            .map(|(_, record)| &record.value);
        Ok(query.apply(selected))
    }
}
