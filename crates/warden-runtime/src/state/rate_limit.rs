//! Per-user sliding-window rate limiting.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use warden_core::{SlidingWindow, Tier};

use crate::config::RateLimits;

/// Result of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,

    /// Seconds until a request would be allowed; > 0 whenever denied
    pub retry_after_secs: u64,

    /// Requests left in the window (`u32::MAX` for unlimited tiers)
    pub remaining: u32,
}

type Shard = Mutex<HashMap<String, SlidingWindow<Instant>>>;

/// Counters sharded by user id hash so unrelated users rarely contend.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    window: Duration,
    limits: RateLimits,
    shards: Vec<Shard>,
}

impl RateLimiter {
    pub fn new(window: Duration, limits: RateLimits, shards: usize) -> Self {
        Self {
            window,
            limits,
            shards: (0..shards.max(1)).map(|_| Mutex::default()).collect(),
        }
    }

    fn shard(&self, user_id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    pub fn check(&self, user_id: &str, tier: Tier, now: Instant) -> RateDecision {
        let Some(limit) = self.limits.limit_for(tier) else {
            return RateDecision {
                allowed: true,
                retry_after_secs: 0,
                remaining: u32::MAX,
            };
        };

        let decision = self
            .shard(user_id)
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| SlidingWindow::new(self.window))
            .check(now, Some(limit));

        RateDecision {
            allowed: decision.allowed,
            retry_after_secs: decision.retry_after_secs(),
            remaining: decision.remaining,
        }
    }

    /// Drop counters with no events left in the window.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut counters = shard.lock();
            let before = counters.len();
            counters.retain(|_, window| {
                window.prune(now);
                !window.is_empty()
            });
            removed += before - counters.len();
        }
        removed
    }

    pub fn tracked_users(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_secs(60), RateLimits::default(), 4)
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_counted_independently() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check("alice", Tier::Guest, now).allowed);
        }
        assert!(!limiter.check("alice", Tier::Guest, now).allowed);
        assert!(limiter.check("bob", Tier::Guest, now).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_not_counted() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..500 {
            let decision = limiter.check("root", Tier::Admin, now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, u32::MAX);
        }
        assert_eq!(limiter.tracked_users(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_counters_pruned() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.check("alice", Tier::User, now);
        assert_eq!(limiter.prune_idle(now + Duration::from_secs(30)), 0);
        assert_eq!(limiter.prune_idle(now + Duration::from_secs(60)), 1);
        assert_eq!(limiter.tracked_users(), 0);
    }
}
