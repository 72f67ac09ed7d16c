//! Circuit breaker to prevent cascade failures.
//!
//! When calls to a dependency fail repeatedly, the circuit opens and
//! subsequent calls fail fast until a cooldown has passed. A single probe is
//! then let through to test recovery.
//!
//! ```text
//! Closed   → Open:     consecutive_failures >= failure_threshold
//! Open     → HalfOpen: first read at or after opened_at + cooldown
//! HalfOpen → Closed:   half_open_probe_count successful probes
//! HalfOpen → Open:     any probe failure (fresh opened_at)
//! ```
//!
//! All reads and writes of the state happen under one lock per breaker.
//! The lock is never held across the wrapped call.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::humantime_duration;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before a probe is allowed
    #[serde(with = "humantime_duration")]
    pub cooldown: Duration,

    /// Successful probes needed to close the circuit
    pub half_open_probe_count: u32,

    /// Deadline applied by [`CircuitBreaker::call`]
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_probe_count: 1,
            timeout: Duration::from_secs(30),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Dependency isolated, calls fail fast
    Open,

    /// Testing if the dependency recovered
    HalfOpen,
}

/// Error returned by a call through a breaker.
#[derive(Error, Debug)]
pub enum CallError<E> {
    #[error("circuit '{breaker}' is open (retry after {retry_after:?})")]
    Open {
        breaker: String,
        retry_after: Duration,
    },

    #[error("call through '{breaker}' timed out after {after:?}")]
    Timeout { breaker: String, after: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Convert the wrapped error, keeping breaker outcomes.
    pub fn map_inner<F, E2>(self, f: F) -> CallError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            CallError::Open {
                breaker,
                retry_after,
            } => CallError::Open {
                breaker,
                retry_after,
            },
            CallError::Timeout { breaker, after } => CallError::Timeout { breaker, after },
            CallError::Inner(e) => CallError::Inner(f(e)),
        }
    }
}

/// Read-only view of a breaker for health and ops reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub probe_in_flight: bool,
    /// Time left until a probe is allowed (open circuits only)
    pub retry_after_ms: Option<u64>,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub transitions: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    probe_in_flight: bool,
    /// Incremented on every entry into HalfOpen, ties probes to their episode
    episode: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_successes: 0,
            probe_in_flight: false,
            episode: 0,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerCounters {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    transitions: AtomicU64,
}

/// Circuit breaker guarding one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    counters: BreakerCounters,
}

/// Admission ticket for one call. Dropping an unsettled probe frees the slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe_episode: Option<u64>,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe_episode);
    }

    fn failure(mut self, timed_out: bool) {
        self.settled = true;
        self.breaker.on_failure(self.probe_episode, timed_out);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(episode) = self.probe_episode {
            let mut s = self.breaker.inner.lock();
            if s.state == CircuitState::HalfOpen && s.episode == episode {
                s.probe_in_flight = false;
                tracing::debug!(breaker = %self.breaker.name, "Probe cancelled, slot released");
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
            counters: BreakerCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` under the configured default timeout.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with_timeout(self.config.timeout, f).await
    }

    /// Run `f` under an explicit deadline.
    ///
    /// Fails fast with [`CallError::Open`] while the circuit is open or a
    /// half-open probe is already in flight. A timeout counts as a failure
    /// and is reported as [`CallError::Timeout`].
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        timeout: Duration,
        f: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.acquire() {
            Ok(permit) => permit,
            Err(retry_after) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(breaker = %self.name, ?retry_after, "Call rejected, circuit open");
                return Err(CallError::Open {
                    breaker: self.name.clone(),
                    retry_after,
                });
            }
        };

        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.failure(false);
                Err(CallError::Inner(e))
            }
            Err(_) => {
                permit.failure(true);
                tracing::warn!(breaker = %self.name, ?timeout, "Call timed out");
                Err(CallError::Timeout {
                    breaker: self.name.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// Current state. Performs the Open → HalfOpen transition when due.
    pub fn state(&self) -> CircuitState {
        let mut s = self.inner.lock();
        self.advance(&mut s, Instant::now());
        s.state
    }

    /// Check if calls are currently failing fast.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut s = self.inner.lock();
        self.advance(&mut s, now);

        let retry_after_ms = match (s.state, s.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                (opened_at + self.config.cooldown)
                    .saturating_duration_since(now)
                    .as_millis() as u64,
            ),
            _ => None,
        };

        CircuitSnapshot {
            name: self.name.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            half_open_successes: s.half_open_successes,
            probe_in_flight: s.probe_in_flight,
            retry_after_ms,
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            transitions: self.counters.transitions.load(Ordering::Relaxed),
        }
    }

    /// Administrative reset to a closed circuit.
    pub fn reset(&self) {
        let mut s = self.inner.lock();
        let from = s.state;
        let episode = s.episode;
        *s = BreakerState::closed();
        s.episode = episode;
        if from != CircuitState::Closed {
            self.counters.transitions.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(breaker = %self.name, from = ?from, "Circuit reset by administrator");
    }

    fn acquire(&self) -> Result<Permit<'_>, Duration> {
        let now = Instant::now();
        let mut s = self.inner.lock();
        self.advance(&mut s, now);

        match s.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                probe_episode: None,
                settled: false,
            }),
            CircuitState::Open => {
                let retry_after = s
                    .opened_at
                    .map(|at| (at + self.config.cooldown).saturating_duration_since(now))
                    .unwrap_or(self.config.cooldown);
                Err(retry_after)
            }
            CircuitState::HalfOpen => {
                if s.probe_in_flight {
                    return Err(Duration::ZERO);
                }
                s.probe_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    probe_episode: Some(s.episode),
                    settled: false,
                })
            }
        }
    }

    /// Open → HalfOpen once the cooldown has elapsed. Caller holds the lock.
    fn advance(&self, s: &mut BreakerState, now: Instant) {
        if s.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = s.opened_at else {
            return;
        };
        if now.saturating_duration_since(opened_at) >= self.config.cooldown {
            s.episode += 1;
            s.half_open_successes = 0;
            s.probe_in_flight = false;
            self.transition(s, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, s: &mut BreakerState, to: CircuitState) {
        let from = s.state;
        s.state = to;
        self.counters.transitions.fetch_add(1, Ordering::Relaxed);
        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = ?from,
                to = ?to,
                consecutive_failures = s.consecutive_failures,
                "Circuit opened"
            ),
            _ => tracing::info!(breaker = %self.name, from = ?from, to = ?to, "Circuit transition"),
        }
    }

    fn on_success(&self, probe_episode: Option<u64>) {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        let mut s = self.inner.lock();
        match s.state {
            CircuitState::Closed => s.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                if probe_episode != Some(s.episode) {
                    return;
                }
                s.probe_in_flight = false;
                s.half_open_successes += 1;
                if s.half_open_successes >= self.config.half_open_probe_count {
                    s.consecutive_failures = 0;
                    s.half_open_successes = 0;
                    s.opened_at = None;
                    self.transition(&mut s, CircuitState::Closed);
                }
            }
            // Opened by a concurrent failure; this late success changes nothing
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, probe_episode: Option<u64>, timed_out: bool) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        let mut s = self.inner.lock();
        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    s.opened_at = Some(Instant::now());
                    self.transition(&mut s, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if probe_episode != Some(s.episode) {
                    return;
                }
                s.probe_in_flight = false;
                s.half_open_successes = 0;
                s.opened_at = Some(Instant::now());
                self.transition(&mut s, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
                ..Default::default()
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CallError<String>> {
        cb.call(|| async { Err::<(), _>("boom".to_string()) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, CallError<String>> {
        cb.call(|| async { Ok::<_, String>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_starts_closed() {
        let cb = breaker(3, 30);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_failures() {
        let cb = breaker(2, 30);

        assert!(matches!(fail(&cb).await, Err(CallError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(matches!(fail(&cb).await, Err(CallError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 30);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();

        // Need 3 more failures to open
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let cb = breaker(1, 30);
        fail(&cb).await.unwrap_err();

        let calls = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        match result {
            Err(CallError::Open { breaker, retry_after }) => {
                assert_eq!(breaker, "llm");
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected open circuit, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_cooldown() {
        let cb = breaker(1, 30);
        fail(&cb).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().retry_after_ms, Some(1_000));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Later reads do not re-trigger the transition
        let transitions = cb.snapshot().transitions;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().transitions, transitions);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_scenario() {
        let cb = breaker(3, 30);
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        // Closed → Open → HalfOpen → Closed
        assert_eq!(snapshot.transitions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let cb = breaker(1, 30);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_probes_required_to_close() {
        let cb = CircuitBreaker::new(
            "search",
            CircuitBreakerConfig {
                failure_threshold: 1,
                half_open_probe_count: 2,
                ..Default::default()
            },
        );
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().half_open_successes, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = breaker(1, 30);
        let result = cb
            .call_with_timeout(Duration::from_secs(1), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(())
            })
            .await;

        match result {
            Err(CallError::Timeout { breaker, after }) => {
                assert_eq!(breaker, "llm");
                assert_eq!(after, Duration::from_secs(1));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_while_half_open() {
        let cb = Arc::new(breaker(1, 30));
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            probe_cb
                .call(|| async move {
                    let _ = wait.await;
                    Ok::<_, String>("probe")
                })
                .await
        });

        while !cb.snapshot().probe_in_flight {
            tokio::task::yield_now().await;
        }

        // A second caller is turned away while the probe runs
        let second = succeed(&cb).await;
        assert!(matches!(second, Err(CallError::Open { .. })));

        release.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), "probe");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_slot() {
        let cb = breaker(1, 30);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        // Outer deadline drops the probe future mid-flight
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| std::future::pending::<Result<(), String>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!cb.snapshot().probe_in_flight);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_circuit() {
        let cb = breaker(1, 30);
        fail(&cb).await.unwrap_err();
        assert!(cb.is_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[test]
    fn test_config_serializes_human_durations() {
        let yaml = serde_yaml::to_string(&CircuitBreakerConfig::default()).unwrap();
        assert!(yaml.contains("cooldown: 30s"));
    }

    proptest! {
        #[test]
        fn prop_opens_iff_threshold_consecutive_failures(
            outcomes in proptest::collection::vec(any::<bool>(), 0..60),
            threshold in 1u32..6,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            rt.block_on(async {
                let cb = breaker(threshold, 3600);
                let mut consecutive = 0u32;
                let mut opened = false;

                for ok in outcomes {
                    let result = if ok { succeed(&cb).await.map(|_| ()) } else { fail(&cb).await };
                    if opened {
                        assert!(matches!(result, Err(CallError::Open { .. })));
                        continue;
                    }
                    if ok {
                        consecutive = 0;
                    } else {
                        consecutive += 1;
                        opened = consecutive >= threshold;
                    }
                    assert_eq!(cb.state() == CircuitState::Open, opened);
                }
            });
        }
    }
}
