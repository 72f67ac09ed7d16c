//! Self-improvement: from skill errors to human-approved memory changes.
//!
//! ## Gates
//!
//! [`ImprovementPipeline::analyze`] runs four gates in order, under a
//! per-skill lock so two concurrent analyses cannot both pass:
//!
//! 1. **Rate limit** - at most `max_proposals_per_window` per skill per window
//! 2. **Deduplicate** - skip errors matching a recent proposal's normalized text
//! 3. **Reflect** - one LLM call through the `llm` breaker; deterministic fallback
//! 4. **Persist** - append-only insert (retried), then notify the approver
//!
//! Nothing touches skill memory until a proposal is approved with
//! [`ImprovementPipeline::apply`].

mod notify;
mod skills;
mod worker;

pub use notify::{parse_action_token, Action, ActionTokens, LogNotifier, Notifier, NotifyError};
pub use skills::{DurableSkillStore, SkillStore};
pub use worker::{ImprovementHandle, ImprovementWorker};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;
use warden_core::{
    is_near_duplicate, normalize_error, summarize_error, truncate, ImprovementProposal,
    ProposalSource, ProposalStatus, SkillMemory, Tier,
};

use crate::config::ImprovementConfig;
use crate::prompts::{fallback_reflection, parse_reflection, reflection_messages, Reflection};
use crate::providers::{CompletionConfig, LlmProvider};
use crate::resilience::CircuitRegistry;
use crate::state::StateManager;
use crate::store::{get_json, DurableStore, RangeQuery, StoreError};

const PROPOSAL_PREFIX: &str = "proposals/";
const MAX_ERROR_CHARS: usize = 8_000;
const SUMMARY_CHARS: usize = 200;

fn proposal_key(id: &str) -> String {
    format!("{}{}", PROPOSAL_PREFIX, id)
}

/// Errors from proposal resolution.
#[derive(Error, Debug)]
pub enum ImprovementError {
    #[error("proposal not found: {0}")]
    NotFound(String),

    #[error("'{approver}' ({tier}) may not resolve proposals")]
    Unauthorized { approver: String, tier: Tier },

    #[error("proposal store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid action token: '{0}'")]
    InvalidToken(String),
}

/// A skill error handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub skill_name: String,
    pub error: String,
    pub context: BTreeMap<String, String>,
}

impl ErrorReport {
    pub fn new(skill_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            error: error.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Filter for [`ImprovementPipeline::list_proposals`].
#[derive(Debug, Clone, Default)]
pub struct ProposalQuery {
    pub skill_name: Option<String>,
    pub status: Option<ProposalStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Async mutex per key. Entries nobody holds are pruned as the map grows.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    const PRUNE_AT: usize = 1024;

    fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() >= Self::PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// Turns skill errors into pending proposals and resolves them.
pub struct ImprovementPipeline {
    config: ImprovementConfig,
    store: Arc<dyn DurableStore>,
    skills: Arc<dyn SkillStore>,
    state: Arc<StateManager>,
    breakers: Arc<CircuitRegistry>,
    provider: Option<Arc<dyn LlmProvider>>,
    notifier: Arc<dyn Notifier>,
    locks: KeyedLocks,
}

impl ImprovementPipeline {
    /// Pipeline using the state manager's store for proposals and skills.
    pub fn new(
        config: ImprovementConfig,
        state: Arc<StateManager>,
        breakers: Arc<CircuitRegistry>,
    ) -> Self {
        let store = Arc::clone(state.store());
        Self {
            config,
            skills: Arc::new(DurableSkillStore::new(Arc::clone(&store))),
            store,
            state,
            breakers,
            provider: None,
            notifier: Arc::new(LogNotifier),
            locks: KeyedLocks::default(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_skill_store(mut self, skills: Arc<dyn SkillStore>) -> Self {
        self.skills = skills;
        self
    }

    pub fn config(&self) -> &ImprovementConfig {
        &self.config
    }

    pub fn skills(&self) -> &Arc<dyn SkillStore> {
        &self.skills
    }

    // ---------------------------------------------------------------------
    // Analysis
    // ---------------------------------------------------------------------

    /// Run the gates for one error. `None` when any gate stops it or the
    /// proposal could not be stored.
    pub async fn analyze(
        &self,
        skill_name: &str,
        error: &str,
        context: &BTreeMap<String, String>,
    ) -> Option<ImprovementProposal> {
        let lock = self.locks.get(skill_name);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let normalized = normalize_error(error, self.config.dedup_prefix_len);
        let lookback = self.config.rate_window.max(self.config.dedup_window);

        let recent = match self.recent_for_skill(skill_name, now, lookback).await {
            Ok(recent) => recent,
            Err(e) => {
                tracing::warn!(skill = skill_name, error = %e, "Cannot read recent proposals, skipping analysis");
                return None;
            }
        };

        // Gate 1: rate limit
        let rate_cutoff = cutoff(now, self.config.rate_window);
        let in_window = recent.iter().filter(|p| p.created_at >= rate_cutoff).count();
        if in_window >= self.config.max_proposals_per_window {
            tracing::debug!(skill = skill_name, in_window, "Proposal rate limit reached");
            return None;
        }

        // Gate 2: deduplicate
        let dedup_cutoff = cutoff(now, self.config.dedup_window);
        if let Some(existing) = recent.iter().find(|p| {
            p.created_at >= dedup_cutoff && is_near_duplicate(&p.error_normalized, &normalized)
        }) {
            tracing::debug!(skill = skill_name, duplicate_of = %existing.id, "Duplicate error, no proposal");
            return None;
        }

        // Gate 3: reflect
        let summary = summarize_error(error, SUMMARY_CHARS);
        let (reflection, source) = match self.reflect(skill_name, error, context).await {
            Some(reflection) => (reflection, ProposalSource::Reflection),
            None => (
                fallback_reflection(skill_name, &summary),
                ProposalSource::Fallback,
            ),
        };

        let proposal = ImprovementProposal {
            id: Uuid::new_v4().to_string(),
            skill_name: skill_name.to_string(),
            error_summary: summary,
            error_normalized: normalized,
            error_full: truncate(error, MAX_ERROR_CHARS),
            proposed_memory_addition: reflection.memory_addition,
            proposed_history_entry: reflection.history_entry,
            source,
            status: ProposalStatus::Pending,
            created_at: now,
            resolved_at: None,
            approver_id: None,
            rejection_reason: None,
        };

        // Gate 4: persist, then notify
        if let Err(e) = self.persist(&proposal).await {
            tracing::error!(skill = skill_name, proposal_id = %proposal.id, error = %e, "Failed to store proposal");
            return None;
        }
        tracing::info!(
            skill = skill_name,
            proposal_id = %proposal.id,
            source = ?proposal.source,
            "Improvement proposal created"
        );
        self.notify(&proposal).await;

        Some(proposal)
    }

    async fn recent_for_skill(
        &self,
        skill_name: &str,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<ImprovementProposal>, StoreError> {
        let query = RangeQuery::prefix(PROPOSAL_PREFIX)
            .filter("skill_name", skill_name)
            .since("created_at", Some(cutoff(now, lookback)));
        self.store
            .query(&query)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    async fn reflect(
        &self,
        skill_name: &str,
        error: &str,
        context: &BTreeMap<String, String>,
    ) -> Option<Reflection> {
        let provider = self.provider.as_ref()?;
        let breaker = match self.breakers.breaker("llm") {
            Ok(breaker) => breaker,
            Err(e) => {
                tracing::warn!(error = %e, "Reflection skipped");
                return None;
            }
        };

        let memory = match self.skills.load(skill_name).await {
            Ok(memory) => memory.unwrap_or_else(|| SkillMemory::empty(skill_name)),
            Err(e) => {
                tracing::warn!(skill = skill_name, error = %e, "Skill memory unavailable, reflecting without it");
                SkillMemory::empty(skill_name)
            }
        };

        let messages = reflection_messages(skill_name, &memory, error, context);
        let completion = CompletionConfig {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
            timeout: self.config.reflect_timeout,
        };

        let response = breaker
            .call_with_timeout(self.config.reflect_timeout, || {
                provider.complete(messages, &completion)
            })
            .await;

        match response {
            Ok(response) => match parse_reflection(&response.content) {
                Ok(reflection) => Some(reflection),
                Err(e) => {
                    tracing::warn!(skill = skill_name, error = %e, "Unusable reflection, using fallback");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    skill = skill_name,
                    provider = provider.name(),
                    error = %e,
                    "Reflection failed, using fallback"
                );
                None
            }
        }
    }

    async fn persist(&self, proposal: &ImprovementProposal) -> Result<(), StoreError> {
        let key = proposal_key(&proposal.id);
        let value = serde_json::to_value(proposal)?;
        let store = &self.store;
        let (key_ref, value_ref) = (key.as_str(), &value);

        let inserted = (|| async move { store.insert(key_ref, value_ref.clone()).await })
            .retry(ExponentialBuilder::default().with_max_times(3))
            .sleep(tokio::time::sleep)
            .when(|e: &StoreError| e.is_transient())
            .notify(|e: &StoreError, after: Duration| {
                tracing::warn!(proposal_id = %proposal.id, error = %e, ?after, "Retrying proposal insert");
            })
            .await?;

        if !inserted {
            tracing::warn!(proposal_id = %proposal.id, "Proposal id already present, not overwritten");
        }
        Ok(())
    }

    async fn notify(&self, proposal: &ImprovementProposal) {
        let Some(approver) = &self.config.approver_id else {
            tracing::debug!(proposal_id = %proposal.id, "No approver configured");
            return;
        };
        let actions = ActionTokens::for_proposal(&proposal.id);
        if let Err(e) = self
            .notifier
            .notify(approver, &proposal.summary(), &actions)
            .await
        {
            tracing::warn!(proposal_id = %proposal.id, error = %e, "Approver notification failed");
        }
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    /// Approve a pending proposal and apply it to the skill's memory.
    ///
    /// Returns `Ok(false)` if the proposal was already resolved; skill
    /// memory is then left untouched.
    pub async fn apply(&self, proposal_id: &str, approver_id: &str) -> Result<bool, ImprovementError> {
        self.authorize(approver_id).await?;
        let skill_name = self.require(proposal_id).await?.skill_name;

        let lock = self.locks.get(&skill_name);
        let _guard = lock.lock().await;

        let mut proposal = self.require(proposal_id).await?;
        if !proposal.is_pending() {
            tracing::info!(proposal_id, status = %proposal.status, "Proposal already resolved");
            return Ok(false);
        }

        let now = Utc::now();
        let mut memory = self
            .skills
            .load(&skill_name)
            .await?
            .unwrap_or_else(|| SkillMemory::empty(&skill_name));

        // A previous attempt may have saved memory before failing to mark the proposal
        if memory.apply_proposal(&proposal, now) {
            self.skills.save(&memory).await?;
        }

        proposal.approve(approver_id, now);
        self.store
            .set(&proposal_key(proposal_id), serde_json::to_value(&proposal).map_err(StoreError::from)?, None)
            .await?;

        tracing::info!(
            proposal_id,
            skill = %skill_name,
            approver = approver_id,
            revision = memory.revision,
            "Proposal approved and applied"
        );
        Ok(true)
    }

    /// Reject a pending proposal. Skill memory is never touched.
    pub async fn reject(
        &self,
        proposal_id: &str,
        approver_id: &str,
        reason: &str,
    ) -> Result<bool, ImprovementError> {
        self.authorize(approver_id).await?;
        let skill_name = self.require(proposal_id).await?.skill_name;

        let lock = self.locks.get(&skill_name);
        let _guard = lock.lock().await;

        let mut proposal = self.require(proposal_id).await?;
        if !proposal.reject(approver_id, reason, Utc::now()) {
            return Ok(false);
        }
        self.store
            .set(&proposal_key(proposal_id), serde_json::to_value(&proposal).map_err(StoreError::from)?, None)
            .await?;

        tracing::info!(proposal_id, skill = %skill_name, approver = approver_id, "Proposal rejected");
        Ok(true)
    }

    /// Handle an inbound `approve:<id>` / `reject:<id>` callback.
    pub async fn resolve_action(&self, token: &str, actor_id: &str) -> Result<bool, ImprovementError> {
        match parse_action_token(token)? {
            (Action::Approve, id) => self.apply(id, actor_id).await,
            (Action::Reject, id) => self.reject(id, actor_id, "rejected by reviewer").await,
        }
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> Result<Option<ImprovementProposal>, ImprovementError> {
        Ok(get_json(self.store.as_ref(), &proposal_key(proposal_id)).await?)
    }

    /// Proposals matching `query`, oldest first.
    pub async fn list_proposals(
        &self,
        query: &ProposalQuery,
    ) -> Result<Vec<ImprovementProposal>, ImprovementError> {
        let mut range = RangeQuery::prefix(PROPOSAL_PREFIX).since("created_at", query.since);
        if let Some(skill) = &query.skill_name {
            range = range.filter("skill_name", skill.as_str());
        }
        if let Some(status) = query.status {
            range = range.filter("status", json!(status));
        }
        if let Some(limit) = query.limit {
            range = range.limit(limit);
        }

        let mut proposals = Vec::new();
        for value in self.store.query(&range).await? {
            proposals.push(serde_json::from_value(value).map_err(StoreError::from)?);
        }
        Ok(proposals)
    }

    async fn require(&self, proposal_id: &str) -> Result<ImprovementProposal, ImprovementError> {
        self.get_proposal(proposal_id)
            .await?
            .ok_or_else(|| ImprovementError::NotFound(proposal_id.to_string()))
    }

    async fn authorize(&self, approver_id: &str) -> Result<(), ImprovementError> {
        let tier = self.state.get_tier_cached(approver_id).await;
        if tier < self.config.min_approver_tier {
            tracing::warn!(approver = approver_id, tier = %tier, "Unauthorized proposal resolution");
            return Err(ImprovementError::Unauthorized {
                approver: approver_id.to_string(),
                tier,
            });
        }
        Ok(())
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365))
}
