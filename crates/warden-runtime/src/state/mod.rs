//! Shared state: tiered cache, rate limiting and tier lookups.
//!
//! ## Cache
//!
//! Reads go to the in-process map (L1) first. An entry is never served past
//! its expiry; expired entries found on read are removed. On an L1 miss the
//! durable store (L2) is consulted and a hit repopulates L1 with the TTL it
//! was written with. Writes go to both layers. L2 problems degrade to a
//! miss and are logged, never surfaced to the caller.
//!
//! ## Rate limiting
//!
//! Sliding 60-second window per user, limits by tier, admin unlimited.
//!
//! ## Tiers
//!
//! Fail-closed: a user whose tier cannot be read is a guest.

mod cache;
mod rate_limit;
mod tiers;

pub use rate_limit::RateDecision;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use warden_core::{validate_key, Tier, ValidationError};

use crate::config::StateConfig;
use crate::store::{DurableStore, StoreError};
use cache::{l2_key, L1Cache, StoredEntry};
use rate_limit::RateLimiter;
use tiers::TierDirectory;

/// Errors from administrative state writes.
#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owner of the cache, rate counters and tier cache.
pub struct StateManager {
    config: StateConfig,
    store: Arc<dyn DurableStore>,
    l1: L1Cache,
    limiter: RateLimiter,
    tiers: TierDirectory,
    last_swept: Mutex<HashMap<String, Instant>>,
    #[cfg(test)]
    panic_next_sweep: std::sync::atomic::AtomicBool,
}

impl StateManager {
    pub fn new(config: StateConfig, store: Arc<dyn DurableStore>) -> Self {
        let limiter = RateLimiter::new(config.rate_window, config.rate_limits, config.rate_shards);
        let tiers = TierDirectory::new(
            Arc::clone(&store),
            config.tier_cache_capacity,
            config.tier_cache_ttl,
        );
        Self {
            config,
            store,
            l1: L1Cache::default(),
            limiter,
            tiers,
            last_swept: Mutex::new(HashMap::new()),
            #[cfg(test)]
            panic_next_sweep: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    // ---------------------------------------------------------------------
    // Cache
    // ---------------------------------------------------------------------

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, ValidationError> {
        validate_key("namespace", namespace)?;
        validate_key("key", key)?;

        if let Some(value) = self.l1.get(namespace, key, Instant::now()) {
            return Ok(Some(value));
        }

        let raw = match self.store.get(&l2_key(namespace, key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(namespace, key, error = %e, "L2 read failed, treating as miss");
                return Ok(None);
            }
        };

        match serde_json::from_value::<StoredEntry>(raw) {
            Ok(entry) => {
                self.l1
                    .insert(namespace, key, entry.value.clone(), entry.ttl(), Instant::now());
                Ok(Some(entry.value))
            }
            Err(e) => {
                tracing::warn!(namespace, key, error = %e, "Malformed L2 entry, treating as miss");
                Ok(None)
            }
        }
    }

    /// Typed [`get`](Self::get). A value of the wrong shape is a miss.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>, ValidationError> {
        let Some(value) = self.get(namespace, key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(typed) => Ok(Some(typed)),
            Err(e) => {
                tracing::warn!(namespace, key, error = %e, "Cached value has unexpected shape");
                Ok(None)
            }
        }
    }

    /// Write-through set. `ttl` defaults to the namespace's configured TTL.
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), ValidationError> {
        validate_key("namespace", namespace)?;
        validate_key("key", key)?;

        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(namespace));
        self.l1
            .insert(namespace, key, value.clone(), ttl, Instant::now());

        let stored = match serde_json::to_value(StoredEntry::new(value, ttl)) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(namespace, key, error = %e, "Could not encode L2 entry");
                return Ok(());
            }
        };
        if let Err(e) = self
            .store
            .set(&l2_key(namespace, key), stored, Some(ttl))
            .await
        {
            tracing::warn!(namespace, key, error = %e, "L2 write failed, entry cached in-process only");
        }
        Ok(())
    }

    pub async fn invalidate(&self, namespace: &str, key: &str) -> Result<(), ValidationError> {
        validate_key("namespace", namespace)?;
        validate_key("key", key)?;

        self.l1.remove(namespace, key);
        if let Err(e) = self.store.delete(&l2_key(namespace, key)).await {
            tracing::warn!(namespace, key, error = %e, "L2 delete failed");
        }
        Ok(())
    }

    /// Remove every expired L1 entry now. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.l1.sweep(now, |_| true);
        let mut last_swept = self.last_swept.lock();
        for (_, at) in last_swept.iter_mut() {
            *at = now;
        }
        removed
    }

    /// One sweeper pass: expired entries of namespaces whose interval has
    /// elapsed, plus idle rate counters.
    fn sweep_due(&self, now: Instant) -> (usize, usize) {
        #[cfg(test)]
        if self
            .panic_next_sweep
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            panic!("injected sweep failure");
        }

        let mut last_swept = self.last_swept.lock();
        let entries = self.l1.sweep(now, |namespace| {
            let interval = self.config.sweep_interval_for(namespace);
            let due = last_swept
                .get(namespace)
                .map_or(true, |&at| now.saturating_duration_since(at) >= interval);
            if due {
                last_swept.insert(namespace.to_string(), now);
            }
            due
        });
        drop(last_swept);
        (entries, self.limiter.prune_idle(now))
    }

    /// In-process entries currently held, expired or not.
    pub fn cached_entries(&self) -> usize {
        self.l1.len()
    }

    /// Start the background sweeper.
    ///
    /// Ticks at the shortest configured sweep interval. A panic inside one
    /// pass is logged and the next tick runs normally.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let state = Arc::clone(self);
        let tick = self.config.sweep_tick();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(?tick, "State sweeper started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut stop => break,
                }

                let pass = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    state.sweep_due(Instant::now())
                }));
                match pass {
                    Ok((entries, counters)) => {
                        tracing::debug!(entries, counters, "Sweep pass finished");
                    }
                    Err(_) => tracing::error!("Sweep pass panicked, sweeper continues"),
                }
            }

            tracing::info!("State sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown),
            task,
        }
    }

    // ---------------------------------------------------------------------
    // Rate limiting and tiers
    // ---------------------------------------------------------------------

    pub fn check_rate(&self, user_id: &str, tier: Tier) -> Result<RateDecision, ValidationError> {
        validate_key("user_id", user_id)?;
        let decision = self.limiter.check(user_id, tier, Instant::now());
        if !decision.allowed {
            tracing::debug!(
                user_id,
                tier = %tier,
                retry_after_secs = decision.retry_after_secs,
                "Rate limited"
            );
        }
        Ok(decision)
    }

    pub async fn get_tier_cached(&self, user_id: &str) -> Tier {
        self.tiers.lookup(user_id).await
    }

    /// Write a user's tier to the directory and drop the cached value.
    pub async fn set_tier(&self, user_id: &str, tier: Tier) -> Result<(), StateError> {
        validate_key("user_id", user_id)?;
        self.tiers.set(user_id, tier).await?;
        Ok(())
    }

    /// Drop every cached tier, e.g. after a bulk directory change.
    pub fn invalidate_tiers(&self) {
        self.tiers.invalidate_all();
    }
}

/// Handle to the background sweeper. Dropping it also stops the task.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!(error = %e, "State sweeper task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
