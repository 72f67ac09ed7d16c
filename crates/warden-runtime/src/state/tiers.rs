//! Cached authorization tier lookups.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;
use serde_json::{json, Value};
use warden_core::{validate_key, Tier};

use crate::store::{DurableStore, StoreError};

pub(crate) fn tier_key(user_id: &str) -> String {
    format!("tiers/{}", user_id)
}

/// Tier directory in the durable store, fronted by a moka TTL cache.
pub(crate) struct TierDirectory {
    cache: Cache<String, Tier>,
    store: Arc<dyn DurableStore>,
}

impl TierDirectory {
    pub fn new(store: Arc<dyn DurableStore>, capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { cache, store }
    }

    /// Fail-closed lookup: anything other than a readable record is guest.
    ///
    /// Absent users are cached as guest; lookup failures are not cached so
    /// the next call retries the store.
    pub async fn lookup(&self, user_id: &str) -> Tier {
        if let Err(e) = validate_key("user_id", user_id) {
            tracing::warn!(error = %e, "Rejected tier lookup");
            return Tier::Guest;
        }
        if let Some(tier) = self.cache.get(user_id).await {
            return tier;
        }

        match self.store.get(&tier_key(user_id)).await {
            Ok(record) => {
                let tier = record.as_ref().map(parse_record).unwrap_or(Tier::Guest);
                self.cache.insert(user_id.to_string(), tier).await;
                tier
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Tier lookup failed, treating as guest");
                Tier::Guest
            }
        }
    }

    pub async fn set(&self, user_id: &str, tier: Tier) -> Result<(), StoreError> {
        let record = json!({ "tier": tier, "updated_at": Utc::now() });
        self.store.set(&tier_key(user_id), record, None).await?;
        self.cache.invalidate(user_id).await;
        tracing::info!(user_id, tier = %tier, "Tier updated");
        Ok(())
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

/// Accepts `{"tier": "admin"}` or a bare `"admin"`.
fn parse_record(record: &Value) -> Tier {
    let raw = record
        .get("tier")
        .and_then(Value::as_str)
        .or_else(|| record.as_str());
    raw.map(Tier::parse_or_guest).unwrap_or(Tier::Guest)
}
