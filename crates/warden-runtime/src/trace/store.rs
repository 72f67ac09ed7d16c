//! Persistence of finished traces.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use warden_core::{ExecutionTrace, TraceStatus};

use crate::store::{get_json, DurableStore, RangeQuery, StoreError};

const PREFIX: &str = "traces/";

/// Filter for [`TraceStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub user_id: Option<String>,
    pub status: Option<TraceStatus>,
    /// Only traces started at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Traces under `traces/{trace_id}`, expiring after the retention period.
#[derive(Clone)]
pub struct TraceStore {
    store: Arc<dyn DurableStore>,
    retention: Duration,
}

impl TraceStore {
    pub fn new(store: Arc<dyn DurableStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub async fn save(&self, trace: &ExecutionTrace) -> Result<(), StoreError> {
        let key = format!("{}{}", PREFIX, trace.trace_id);
        let value = serde_json::to_value(trace)?;
        self.store.set(&key, value, Some(self.retention)).await
    }

    pub async fn load(&self, trace_id: &str) -> Result<Option<ExecutionTrace>, StoreError> {
        get_json(self.store.as_ref(), &format!("{}{}", PREFIX, trace_id)).await
    }

    /// Matching traces, oldest first.
    pub async fn list(&self, query: &TraceQuery) -> Result<Vec<ExecutionTrace>, StoreError> {
        let mut range = RangeQuery::prefix(PREFIX).since("started_at", query.since);
        if let Some(user_id) = &query.user_id {
            range = range.filter("user_id", user_id.as_str());
        }
        if let Some(status) = query.status {
            range = range.filter("status", json!(status));
        }
        if let Some(limit) = query.limit {
            range = range.limit(limit);
        }

        let mut traces = Vec::new();
        for value in self.store.query(&range).await? {
            traces.push(serde_json::from_value(value)?);
        }
        Ok(traces)
    }
}
