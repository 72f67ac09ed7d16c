//! The assembled runtime.
//!
//! [`WardenRuntime`] wires one of each component from a [`WardenConfig`]:
//! breaker registry, state manager with its sweeper, tracer and trace
//! store, improvement pipeline and worker. Everything shares a single
//! durable store.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use warden_core::Tier;

use crate::config::WardenConfig;
use crate::improvement::{
    ImprovementHandle, ImprovementPipeline, ImprovementWorker, Notifier, SkillStore,
};
use crate::providers::LlmProvider;
use crate::resilience::{CircuitBreaker, CircuitRegistry};
use crate::state::{RateDecision, StateManager, SweeperHandle};
use crate::store::{DurableStore, MemoryStore};
use crate::trace::{TraceOutcome, TraceRequest, TraceStore, Tracer};
use crate::RuntimeError;

/// Running components. Create with [`WardenRuntime::builder`].
pub struct WardenRuntime {
    config: WardenConfig,
    breakers: Arc<CircuitRegistry>,
    state: Arc<StateManager>,
    tracer: Tracer,
    traces: TraceStore,
    pipeline: Arc<ImprovementPipeline>,
    improvements: ImprovementHandle,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl WardenRuntime {
    pub fn builder() -> WardenRuntimeBuilder {
        WardenRuntimeBuilder::new()
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitRegistry> {
        &self.breakers
    }

    /// Breaker guarding a named dependency.
    pub fn breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>, RuntimeError> {
        Ok(self.breakers.breaker(name)?)
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    pub fn pipeline(&self) -> &Arc<ImprovementPipeline> {
        &self.pipeline
    }

    pub fn improvements(&self) -> &ImprovementHandle {
        &self.improvements
    }

    /// Rate-limit a request from `user_id` by its tier.
    ///
    /// Returns the decision when allowed, [`RuntimeError::RateLimited`]
    /// otherwise.
    pub async fn admit(&self, user_id: &str) -> Result<(Tier, RateDecision), RuntimeError> {
        let tier = self.state.get_tier_cached(user_id).await;
        let decision = self.state.check_rate(user_id, tier)?;
        if !decision.allowed {
            tracing::info!(
                user_id,
                tier = %tier,
                retry_after_secs = decision.retry_after_secs,
                "Request rate limited"
            );
            return Err(RuntimeError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }
        Ok((tier, decision))
    }

    /// Run a request under a new trace.
    pub async fn traced<F, T, E>(&self, request: TraceRequest, fut: F) -> TraceOutcome<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.tracer.run(request, fut).await
    }

    /// Stop the sweeper and drain the improvement queue.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
        self.improvements.shutdown().await;
        tracing::info!(
            dropped_reports = self.improvements.dropped(),
            processed_reports = self.improvements.processed(),
            "Runtime shut down"
        );
    }
}

/// Builder for [`WardenRuntime`].
pub struct WardenRuntimeBuilder {
    config: WardenConfig,
    store: Option<Arc<dyn DurableStore>>,
    provider: Option<Arc<dyn LlmProvider>>,
    notifier: Option<Arc<dyn Notifier>>,
    skills: Option<Arc<dyn SkillStore>>,
    sweeper: bool,
}

impl WardenRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: WardenConfig::default(),
            store: None,
            provider: None,
            notifier: None,
            skills: None,
            sweeper: true,
        }
    }

    pub fn config(mut self, config: WardenConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable store shared by every component. Defaults to [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Provider for reflection. Without one, proposals use the fallback text.
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn skill_store(mut self, skills: Arc<dyn SkillStore>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// Whether to spawn the background cache sweeper. On by default.
    pub fn sweeper(mut self, enabled: bool) -> Self {
        self.sweeper = enabled;
        self
    }

    /// Validate the config and start the background tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<WardenRuntime, RuntimeError> {
        self.config.validate()?;
        let config = self.config;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        tracing::info!(store = store.name(), "Building runtime");

        let breakers = Arc::new(CircuitRegistry::from_settings(&config.breakers));
        let state = Arc::new(StateManager::new(config.state.clone(), Arc::clone(&store)));

        let mut pipeline = ImprovementPipeline::new(
            config.improvement.clone(),
            Arc::clone(&state),
            Arc::clone(&breakers),
        );
        if let Some(provider) = self.provider {
            pipeline = pipeline.with_provider(provider);
        }
        if let Some(notifier) = self.notifier {
            pipeline = pipeline.with_notifier(notifier);
        }
        if let Some(skills) = self.skills {
            pipeline = pipeline.with_skill_store(skills);
        }
        let pipeline = Arc::new(pipeline);
        let improvements =
            ImprovementWorker::spawn(Arc::clone(&pipeline), config.improvement.queue_capacity);

        let traces = TraceStore::new(Arc::clone(&store), config.trace.retention);
        let tracer = Tracer::new(config.trace.clone())
            .with_store(traces.clone())
            .with_improvements(improvements.clone());

        let sweeper = self.sweeper.then(|| state.spawn_sweeper());

        Ok(WardenRuntime {
            config,
            breakers,
            state,
            tracer,
            traces,
            pipeline,
            improvements,
            sweeper: Mutex::new(sweeper),
        })
    }
}

impl Default for WardenRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
