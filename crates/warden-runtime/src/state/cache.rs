//! In-process (L1) cache and the durable (L2) entry format.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    /// `None` when the TTL runs past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Shape of an L2 record under `cache/{namespace}/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub value: Value,
    pub ttl_ms: u64,
}

impl StoredEntry {
    pub fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

pub(crate) fn l2_key(namespace: &str, key: &str) -> String {
    format!("cache/{}/{}", namespace, key)
}

/// Namespace → key → entry. One lock for the whole map.
#[derive(Debug, Default)]
pub(crate) struct L1Cache {
    namespaces: Mutex<HashMap<String, HashMap<String, CacheEntry>>>,
}

impl L1Cache {
    /// Live value, removing the entry if it has expired.
    pub fn get(&self, namespace: &str, key: &str, now: Instant) -> Option<Value> {
        let mut namespaces = self.namespaces.lock();
        let entries = namespaces.get_mut(namespace)?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, namespace: &str, key: &str, value: Value, ttl: Duration, now: Instant) {
        self.namespaces
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at: now.checked_add(ttl),
                },
            );
    }

    pub fn remove(&self, namespace: &str, key: &str) -> bool {
        self.namespaces
            .lock()
            .get_mut(namespace)
            .is_some_and(|entries| entries.remove(key).is_some())
    }

    /// Remove expired entries in the namespaces selected by `due`.
    pub fn sweep(&self, now: Instant, mut due: impl FnMut(&str) -> bool) -> usize {
        let mut namespaces = self.namespaces.lock();
        let mut removed = 0;
        for (namespace, entries) in namespaces.iter_mut() {
            if !due(namespace) {
                continue;
            }
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            removed += before - entries.len();
        }
        namespaces.retain(|_, entries| !entries.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.namespaces.lock().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entry_not_served_past_expiry() {
        let cache = L1Cache::default();
        let start = Instant::now();
        cache.insert("ns", "k", json!("v"), Duration::from_secs(5), start);

        assert_eq!(cache.get("ns", "k", start + Duration::from_secs(4)), Some(json!("v")));
        assert_eq!(cache.get("ns", "k", start + Duration::from_secs(5)), None);
        // Expired entry was evicted on read
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_due_namespaces() {
        let cache = L1Cache::default();
        let start = Instant::now();
        cache.insert("fast", "a", json!(1), Duration::from_secs(1), start);
        cache.insert("slow", "b", json!(2), Duration::from_secs(1), start);

        let later = start + Duration::from_secs(2);
        assert_eq!(cache.sweep(later, |ns| ns == "fast"), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep(later, |_| true), 1);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_never_expires() {
        let cache = L1Cache::default();
        let start = Instant::now();
        cache.insert("ns", "k", json!("v"), Duration::MAX, start);

        let later = start + Duration::from_secs(365 * 24 * 3600);
        assert_eq!(cache.sweep(later, |_| true), 0);
        assert_eq!(cache.get("ns", "k", later), Some(json!("v")));
    }

    #[test]
    fn test_l2_key_layout() {
        assert_eq!(l2_key("search_results", "q:rust"), "cache/search_results/q:rust");
        let stored = StoredEntry::new(json!(1), Duration::from_secs(90));
        assert_eq!(stored.ttl_ms, 90_000);
        assert_eq!(stored.ttl(), Duration::from_secs(90));

        let forever = StoredEntry::new(json!(1), Duration::MAX);
        assert_eq!(forever.ttl_ms, u64::MAX);
    }
}
