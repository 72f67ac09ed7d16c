//! Execution tracing of user-facing requests.
//!
//! [`Tracer::run`] makes a trace the active trace of the current task for
//! the duration of a future. Code running inside records tool and LLM calls
//! with [`record_span`], [`traced_call`] or [`traced_breaker_call`]; outside
//! a traced scope those are no-ops.
//!
//! Registration always ends when `run` returns, whatever the outcome of the
//! traced work or of persisting the trace.

mod store;

pub use store::{TraceQuery, TraceStore};

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;
use warden_core::{
    sanitize_params, truncate, ExecutionTrace, SanitizeOptions, ToolSpan, TraceStatus,
};

use crate::config::TraceConfig;
use crate::improvement::{ErrorReport, ImprovementHandle};
use crate::resilience::{CallError, CircuitBreaker};

tokio::task_local! {
    static ACTIVE_TRACE: Arc<ActiveTrace>;
}

/// Trace being recorded by the current task.
struct ActiveTrace {
    trace_id: String,
    trace: Mutex<ExecutionTrace>,
    max_spans: usize,
    sanitize: SanitizeOptions,
    improvements: Option<ImprovementHandle>,
}

/// What to trace.
#[derive(Debug, Clone, Default)]
pub struct TraceRequest {
    pub user_id: Option<String>,
    pub skill: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Deadline for the whole request
    pub deadline: Option<Duration>,
}

impl TraceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Failure of traced work.
#[derive(Debug)]
pub enum TracedError<E> {
    /// The work returned an error
    Failed(E),
    /// The request deadline passed first
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for TracedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracedError::Failed(e) => write!(f, "{}", e),
            TracedError::TimedOut(after) => write!(f, "request timed out after {:?}", after),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for TracedError<E> {}

/// Result of [`Tracer::run`] with the finalized trace.
#[derive(Debug)]
pub struct TraceOutcome<T, E> {
    pub trace: ExecutionTrace,
    pub result: Result<T, TracedError<E>>,
}

impl<T, E> TraceOutcome<T, E> {
    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    pub fn status(&self) -> TraceStatus {
        self.trace.status
    }
}

/// Starts traces and persists the finished ones.
#[derive(Clone)]
pub struct Tracer {
    config: TraceConfig,
    store: Option<TraceStore>,
    improvements: Option<ImprovementHandle>,
    active: Arc<Mutex<HashSet<String>>>,
}

/// Removes a trace from the active set however `run` exits.
struct Registration {
    active: Arc<Mutex<HashSet<String>>>,
    trace_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.active.lock().remove(&self.trace_id);
    }
}

impl Tracer {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            store: None,
            improvements: None,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Persist sampled and failed traces here.
    pub fn with_store(mut self, store: TraceStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Forward error spans to the improvement worker.
    pub fn with_improvements(mut self, handle: ImprovementHandle) -> Self {
        self.improvements = Some(handle);
        self
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Number of traces currently running.
    pub fn active_traces(&self) -> usize {
        self.active.lock().len()
    }

    /// Run `fut` as a traced request.
    pub async fn run<F, T, E>(&self, request: TraceRequest, fut: F) -> TraceOutcome<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let trace_id = Uuid::new_v4().to_string();
        let sampled = fastrand::f64() < self.config.success_sample_rate;

        let mut trace = ExecutionTrace::new(
            trace_id.clone(),
            request.user_id.clone(),
            request.skill.clone(),
            sampled,
        );
        trace.metadata = request.metadata;

        let active = Arc::new(ActiveTrace {
            trace_id: trace_id.clone(),
            trace: Mutex::new(trace),
            max_spans: self.config.max_child_spans,
            sanitize: SanitizeOptions {
                max_value_len: self.config.max_value_len,
                ..Default::default()
            },
            improvements: self.improvements.clone(),
        });

        let span = tracing::info_span!(
            "trace",
            trace_id = %trace_id,
            user_id = request.user_id.as_deref().unwrap_or(""),
            skill = request.skill.as_deref().unwrap_or(""),
        );

        let result = {
            self.active.lock().insert(trace_id.clone());
            let _registration = Registration {
                active: Arc::clone(&self.active),
                trace_id: trace_id.clone(),
            };

            let deadline = request.deadline;
            ACTIVE_TRACE
                .scope(
                    Arc::clone(&active),
                    async move {
                        match deadline {
                            Some(limit) => match tokio::time::timeout(limit, fut).await {
                                Ok(result) => result.map_err(TracedError::Failed),
                                Err(_) => Err(TracedError::TimedOut(limit)),
                            },
                            None => fut.await.map_err(TracedError::Failed),
                        }
                    },
                )
                .instrument(span.clone())
                .await
        };

        let outcome = match &result {
            Ok(_) => TraceStatus::Success,
            Err(TracedError::Failed(e)) => {
                active
                    .trace
                    .lock()
                    .metadata
                    .insert("error".to_string(), truncate(&e.to_string(), self.config.max_value_len));
                TraceStatus::Error
            }
            Err(TracedError::TimedOut(_)) => TraceStatus::Timeout,
        };

        let trace = {
            let mut trace = active.trace.lock();
            trace.finish(outcome);
            trace.clone()
        };

        span.in_scope(|| {
            tracing::debug!(
                status = %trace.status,
                spans = trace.child_spans.len(),
                duration_ms = trace.duration_ms().unwrap_or_default(),
                "Trace finished"
            )
        });

        if trace.should_persist() {
            if let Some(store) = &self.store {
                if let Err(e) = store.save(&trace).await {
                    tracing::warn!(trace_id = %trace.trace_id, error = %e, "Failed to persist trace");
                }
            }
        }

        TraceOutcome { trace, result }
    }
}

/// Id of the active trace, if the current task is traced.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE.try_with(|active| active.trace_id.clone()).ok()
}

/// Read the active trace.
pub fn with_active_trace<R>(f: impl FnOnce(&ExecutionTrace) -> R) -> Option<R> {
    ACTIVE_TRACE
        .try_with(|active| f(&active.trace.lock()))
        .ok()
}

/// Attach a metadata entry to the active trace.
pub fn annotate(key: impl Into<String>, value: impl Into<String>) -> bool {
    ACTIVE_TRACE
        .try_with(|active| {
            active.trace.lock().metadata.insert(key.into(), value.into());
        })
        .is_ok()
}

/// Record a completed call in the active trace.
///
/// Returns `false` outside a traced scope or when the span cap was hit.
/// Error spans are forwarded to the improvement worker.
pub fn record_span(
    name: &str,
    params: &Value,
    output_summary: &str,
    duration: Duration,
    is_error: bool,
) -> bool {
    record(name, params, output_summary, duration, is_error, is_error)
}

fn record(
    name: &str,
    params: &Value,
    output: &str,
    duration: Duration,
    is_error: bool,
    forward: bool,
) -> bool {
    ACTIVE_TRACE
        .try_with(|active| {
            let started_at = Utc::now()
                - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
            let span = ToolSpan {
                name: name.to_string(),
                sanitized_input: sanitize_params(params, &active.sanitize),
                output_summary: truncate(output, active.sanitize.max_value_len),
                duration_ms: duration.as_millis() as u64,
                is_error,
                started_at,
            };

            let (appended, skill, user_id) = {
                let mut trace = active.trace.lock();
                let appended = trace.push_span(span, active.max_spans);
                (appended, trace.skill.clone(), trace.user_id.clone())
            };

            if forward {
                if let Some(improvements) = &active.improvements {
                    let mut report = ErrorReport::new(skill.unwrap_or_else(|| name.to_string()), output)
                        .context("trace_id", active.trace_id.clone())
                        .context("tool", name);
                    if let Some(user_id) = user_id {
                        report = report.context("user_id", user_id);
                    }
                    improvements.submit(report);
                }
            }
            appended
        })
        .unwrap_or(false)
}

/// Time `fut` and record it as a span of the active trace.
pub async fn traced_call<F, T, E>(name: &str, params: &Value, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let result = fut.await;
    let elapsed = started.elapsed();
    match &result {
        Ok(_) => record(name, params, "ok", elapsed, false, false),
        Err(e) => record(name, params, &e.to_string(), elapsed, true, true),
    };
    result
}

/// Call through a breaker and record the outcome as a span.
///
/// Timeouts are error spans with the elapsed duration. Calls rejected by an
/// open circuit are recorded as error spans but not forwarded for
/// improvement, since they say nothing about the skill.
pub async fn traced_breaker_call<F, Fut, T, E>(
    breaker: &CircuitBreaker,
    timeout: Option<Duration>,
    name: &str,
    params: &Value,
    f: F,
) -> Result<T, CallError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let result = match timeout {
        Some(timeout) => breaker.call_with_timeout(timeout, f).await,
        None => breaker.call(f).await,
    };
    let elapsed = started.elapsed();
    match &result {
        Ok(_) => record(name, params, "ok", elapsed, false, false),
        Err(e @ CallError::Open { .. }) => record(name, params, &e.to_string(), elapsed, true, false),
        Err(e) => record(name, params, &e.to_string(), elapsed, true, true),
    };
    result
}
