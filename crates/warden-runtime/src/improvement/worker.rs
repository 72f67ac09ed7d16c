//! Background worker that feeds error reports to the pipeline.
//!
//! Submission never blocks the request path: reports go into a bounded
//! queue and are dropped (and counted) when it is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{ErrorReport, ImprovementPipeline};

/// Spawns the analysis task.
pub struct ImprovementWorker;

impl ImprovementWorker {
    /// Start a worker with a queue of `capacity` reports.
    pub fn spawn(pipeline: Arc<ImprovementPipeline>, capacity: usize) -> ImprovementHandle {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(run(pipeline, rx, stop_rx, Arc::clone(&counters)));

        ImprovementHandle {
            tx,
            shared: Arc::new(Shared {
                counters,
                stop: Mutex::new(Some(stop_tx)),
                task: Mutex::new(Some(task)),
            }),
        }
    }
}

#[derive(Default)]
struct Counters {
    dropped: AtomicU64,
    processed: AtomicU64,
    panicked: AtomicU64,
}

struct Shared {
    counters: Arc<Counters>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable submission side of the worker.
#[derive(Clone)]
pub struct ImprovementHandle {
    tx: mpsc::Sender<ErrorReport>,
    shared: Arc<Shared>,
}

impl ImprovementHandle {
    /// Queue a report. Returns false if it was dropped.
    pub fn submit(&self, report: ErrorReport) -> bool {
        match self.tx.try_send(report) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(report)) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(skill = %report.skill_name, "Improvement queue full, report dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(report)) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(skill = %report.skill_name, "Improvement worker stopped, report dropped");
                false
            }
        }
    }

    /// Reports dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.shared.counters.dropped.load(Ordering::Relaxed)
    }

    /// Reports analyzed, including ones that panicked.
    pub fn processed(&self) -> u64 {
        self.shared.counters.processed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.shared.counters.panicked.load(Ordering::Relaxed)
    }

    /// Stop accepting reports, finish the queued ones and wait for the task.
    pub async fn shutdown(&self) {
        if let Some(stop) = self.shared.stop.lock().take() {
            let _ = stop.send(());
        }
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Improvement worker ended abnormally");
            }
        }
    }
}

async fn run(
    pipeline: Arc<ImprovementPipeline>,
    mut rx: mpsc::Receiver<ErrorReport>,
    mut stop: oneshot::Receiver<()>,
    counters: Arc<Counters>,
) {
    tracing::debug!("Improvement worker started");
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            report = rx.recv() => match report {
                Some(report) => process(&pipeline, report, &counters).await,
                None => {
                    tracing::debug!("All improvement handles dropped, worker exiting");
                    return;
                }
            },
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(report) = rx.recv().await {
        process(&pipeline, report, &counters).await;
        drained += 1;
    }
    tracing::info!(drained, "Improvement worker stopped");
}

/// Analyze one report in its own task so a panic cannot kill the worker.
async fn process(pipeline: &Arc<ImprovementPipeline>, report: ErrorReport, counters: &Counters) {
    let skill = report.skill_name.clone();
    let pipeline = Arc::clone(pipeline);
    let outcome = tokio::spawn(async move {
        pipeline
            .analyze(&report.skill_name, &report.error, &report.context)
            .await
    })
    .await;

    counters.processed.fetch_add(1, Ordering::Relaxed);
    match outcome {
        Ok(Some(proposal)) => {
            tracing::debug!(skill = %skill, proposal_id = %proposal.id, "Report produced a proposal");
        }
        Ok(None) => {}
        Err(e) if e.is_panic() => {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!(skill = %skill, "Improvement analysis panicked");
        }
        Err(e) => {
            tracing::error!(skill = %skill, error = %e, "Improvement analysis cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerSettings, ImprovementConfig, StateConfig};
    use crate::improvement::ProposalQuery;
    use crate::providers::{ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError};
    use crate::resilience::CircuitRegistry;
    use crate::state::StateManager;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn pipeline() -> Arc<ImprovementPipeline> {
        let state = Arc::new(StateManager::new(
            StateConfig::default(),
            Arc::new(MemoryStore::new()),
        ));
        let breakers = Arc::new(CircuitRegistry::from_settings(&BreakerSettings::default()));
        Arc::new(ImprovementPipeline::new(
            ImprovementConfig::default(),
            state,
            breakers,
        ))
    }

    #[tokio::test]
    async fn test_reports_become_proposals() {
        let pipeline = pipeline();
        let handle = ImprovementWorker::spawn(Arc::clone(&pipeline), 8);

        assert!(handle.submit(ErrorReport::new("weather", "KeyError: 'city'")));
        assert!(handle.submit(ErrorReport::new("search", "index unavailable")));
        handle.shutdown().await;

        assert_eq!(handle.processed(), 2);
        let proposals = pipeline.list_proposals(&ProposalQuery::default()).await.unwrap();
        assert_eq!(proposals.len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let pipeline = pipeline();
        let handle = ImprovementWorker::spawn(Arc::clone(&pipeline), 1);

        // Current-thread runtime: the worker has not polled yet
        assert!(handle.submit(ErrorReport::new("weather", "first")));
        assert!(!handle.submit(ErrorReport::new("weather", "second")));
        assert_eq!(handle.dropped(), 1);

        handle.shutdown().await;
        assert_eq!(handle.processed(), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let handle = ImprovementWorker::spawn(pipeline(), 4);
        handle.shutdown().await;
        handle.shutdown().await;

        assert!(!handle.submit(ErrorReport::new("weather", "late")));
        assert_eq!(handle.dropped(), 1);
    }

    struct PanickingProvider;

    #[async_trait]
    impl LlmProvider for PanickingProvider {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            panic!("provider bug");
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panicking_analysis_does_not_stop_worker() {
        let state = Arc::new(StateManager::new(
            StateConfig::default(),
            Arc::new(MemoryStore::new()),
        ));
        let breakers = Arc::new(CircuitRegistry::from_settings(&BreakerSettings::default()));
        let pipeline = Arc::new(
            ImprovementPipeline::new(ImprovementConfig::default(), state, breakers)
                .with_provider(Arc::new(PanickingProvider)),
        );
        let handle = ImprovementWorker::spawn(pipeline, 4);

        handle.submit(ErrorReport::new("weather", "one"));
        handle.submit(ErrorReport::new("search", "two"));
        handle.shutdown().await;

        assert_eq!(handle.processed(), 2);
        assert_eq!(handle.panicked(), 2);
    }
}
