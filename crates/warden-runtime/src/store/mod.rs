//! Durable key-value store abstraction.
//!
//! The store is opaque: JSON values under string keys, optional TTL,
//! append-only inserts and simple prefix/equality/time-range queries.
//! Key layout used by the runtime:
//!
//! | prefix | contents |
//! |---|---|
//! | `cache/{namespace}/{key}` | L2 cache entries |
//! | `tiers/{user_id}` | authorization tier directory |
//! | `traces/{trace_id}` | persisted execution traces |
//! | `proposals/{id}` | improvement proposals |
//! | `skills/{name}` | skill memory |

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::cmp::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Errors from a durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Query over records under a key prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQuery {
    pub prefix: String,

    /// Top-level field equality filters
    pub filters: Vec<(String, Value)>,

    /// RFC 3339 timestamp field used for `since` and ordering
    pub time_field: Option<String>,

    pub since: Option<DateTime<Utc>>,

    pub limit: Option<usize>,
}

impl RangeQuery {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Order by `field` and keep records at or after `since`.
    pub fn since(mut self, field: impl Into<String>, since: Option<DateTime<Utc>>) -> Self {
        self.time_field = Some(field.into());
        self.since = since;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, value: &Value) -> bool {
        let filtered = self
            .filters
            .iter()
            .all(|(field, expected)| value.get(field) == Some(expected));
        if !filtered {
            return false;
        }
        match (&self.time_field, self.since) {
            (Some(field), Some(since)) => {
                timestamp(value, field).is_some_and(|at| at >= since)
            }
            _ => true,
        }
    }

    /// Filter, order and limit records already selected by prefix.
    pub(crate) fn apply<'a>(&self, records: impl Iterator<Item = &'a Value>) -> Vec<Value> {
        let mut out: Vec<Value> = records.filter(|v| self.matches(v)).cloned().collect();
        if let Some(field) = &self.time_field {
            out.sort_by(|a, b| match (timestamp(a, field), timestamp(b, field)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

fn timestamp(value: &Value, field: &str) -> Option<DateTime<Utc>> {
    value
        .get(field)?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Durable key-value backend.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Upsert, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Append-only insert. Returns false if the key already exists.
    async fn insert(&self, key: &str, value: Value) -> Result<bool, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn query(&self, query: &RangeQuery) -> Result<Vec<Value>, StoreError>;
}

/// Typed read.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}
