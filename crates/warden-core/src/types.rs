//! Core records shared by the runtime components.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =========================================================================
// AUTHORIZATION TIERS
// =========================================================================

/// Authorization tier of a user.
///
/// Ordered from least to most privileged, so `tier >= Tier::Developer`
/// reads as "developer or above".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Guest,
    User,
    Developer,
    Admin,
}

impl Tier {
    /// Requests allowed per rate window. `None` means unlimited.
    pub fn default_rate_limit(&self) -> Option<u32> {
        match self {
            Tier::Guest => Some(10),
            Tier::User => Some(30),
            Tier::Developer => Some(100),
            Tier::Admin => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Guest => "guest",
            Tier::User => "user",
            Tier::Developer => "developer",
            Tier::Admin => "admin",
        }
    }

    /// Parse a stored tier, falling back to the lowest privilege.
    ///
    /// Unknown or corrupted values must never grant access.
    pub fn parse_or_guest(s: &str) -> Self {
        s.parse().unwrap_or(Tier::Guest)
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Guest
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(Tier::Guest),
            "user" => Ok(Tier::User),
            "developer" => Ok(Tier::Developer),
            "admin" => Ok(Tier::Admin),
            other => Err(format!("unknown tier: '{}'", other)),
        }
    }
}

// =========================================================================
// EXECUTION TRACES
// =========================================================================

/// Status of a traced request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Success,
    Error,
    Timeout,
    /// The span cap was hit and later spans were dropped.
    Degraded,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Running => "running",
            TraceStatus::Success => "success",
            TraceStatus::Error => "error",
            TraceStatus::Timeout => "timeout",
            TraceStatus::Degraded => "degraded",
        }
    }

    /// Anything other than a clean success is always persisted.
    pub fn always_persisted(&self) -> bool {
        !matches!(self, TraceStatus::Success | TraceStatus::Running)
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TraceStatus::Running),
            "success" => Ok(TraceStatus::Success),
            "error" => Ok(TraceStatus::Error),
            "timeout" => Ok(TraceStatus::Timeout),
            "degraded" => Ok(TraceStatus::Degraded),
            other => Err(format!("unknown trace status: '{}'", other)),
        }
    }
}

/// One tool or LLM invocation inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpan {
    /// Tool or dependency name
    pub name: String,

    /// Parameters after redaction and truncation
    pub sanitized_input: serde_json::Value,

    /// Truncated result or error text
    pub output_summary: String,

    /// Wall time of the call
    pub duration_ms: u64,

    /// Whether the call failed (including timeouts)
    pub is_error: bool,

    /// When the call started
    pub started_at: DateTime<Utc>,
}

/// Execution record of a single user-facing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub user_id: Option<String>,
    pub skill: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TraceStatus,
    pub child_spans: Vec<ToolSpan>,
    pub metadata: BTreeMap<String, String>,

    /// Spans rejected after the cap was reached
    #[serde(default)]
    pub dropped_spans: u32,

    /// Sampling decision taken at creation; success traces persist only when set
    #[serde(default)]
    pub sampled: bool,
}

impl ExecutionTrace {
    /// Start a new running trace.
    pub fn new(
        trace_id: impl Into<String>,
        user_id: Option<String>,
        skill: Option<String>,
        sampled: bool,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            user_id,
            skill,
            started_at: Utc::now(),
            ended_at: None,
            status: TraceStatus::Running,
            child_spans: Vec::new(),
            metadata: BTreeMap::new(),
            dropped_spans: 0,
            sampled,
        }
    }

    /// Append a span, enforcing the span cap.
    ///
    /// Returns `false` when the span was dropped. The first drop flips the
    /// trace to [`TraceStatus::Degraded`].
    pub fn push_span(&mut self, span: ToolSpan, max_spans: usize) -> bool {
        if self.child_spans.len() >= max_spans {
            if self.dropped_spans == 0 {
                tracing::warn!(
                    trace_id = %self.trace_id,
                    max_spans,
                    "Span limit reached, dropping further spans"
                );
            }
            self.dropped_spans = self.dropped_spans.saturating_add(1);
            self.status = TraceStatus::Degraded;
            return false;
        }
        self.child_spans.push(span);
        true
    }

    /// Close the trace with the outcome of the traced work.
    ///
    /// Error and timeout outcomes win over a degraded marker; a success
    /// outcome keeps the degraded marker if spans were dropped.
    pub fn finish(&mut self, outcome: TraceStatus) {
        self.status = match (outcome, self.status) {
            (TraceStatus::Success, TraceStatus::Degraded) => TraceStatus::Degraded,
            (outcome, _) => outcome,
        };
        if self.dropped_spans > 0 {
            self.metadata
                .insert("dropped_spans".to_string(), self.dropped_spans.to_string());
        }
        self.ended_at = Some(Utc::now());
    }

    /// Whether this trace should be written to durable storage.
    pub fn should_persist(&self) -> bool {
        self.status.always_persisted() || self.sampled
    }

    pub fn error_spans(&self) -> impl Iterator<Item = &ToolSpan> {
        self.child_spans.iter().filter(|s| s.is_error)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

// =========================================================================
// IMPROVEMENT PROPOSALS
// =========================================================================

/// Lifecycle of an improvement proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "rejected" => Ok(ProposalStatus::Rejected),
            other => Err(format!("unknown proposal status: '{}'", other)),
        }
    }
}

/// How the proposal text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    /// Written by the reflection LLM call
    Reflection,
    /// Built from the raw error because reflection failed
    Fallback,
}

/// A suggested, human-approved edit to a skill's memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementProposal {
    pub id: String,
    pub skill_name: String,
    pub error_summary: String,
    /// Dedup key derived from the error text
    pub error_normalized: String,
    pub error_full: String,
    pub proposed_memory_addition: String,
    pub proposed_history_entry: String,
    pub source: ProposalSource,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub approver_id: Option<String>,
    pub rejection_reason: Option<String>,
}

impl ImprovementProposal {
    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }

    /// Mark approved. Returns `false` if the proposal was already resolved.
    pub fn approve(&mut self, approver_id: &str, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ProposalStatus::Approved;
        self.approver_id = Some(approver_id.to_string());
        self.resolved_at = Some(at);
        true
    }

    /// Mark rejected. Returns `false` if the proposal was already resolved.
    pub fn reject(&mut self, approver_id: &str, reason: &str, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ProposalStatus::Rejected;
        self.approver_id = Some(approver_id.to_string());
        self.rejection_reason = Some(reason.to_string());
        self.resolved_at = Some(at);
        true
    }

    /// One-paragraph text shown to the approver.
    pub fn summary(&self) -> String {
        format!(
            "Skill '{}' failed: {}\nProposed memory: {}\nHistory entry: {}",
            self.skill_name,
            self.error_summary,
            self.proposed_memory_addition,
            self.proposed_history_entry
        )
    }
}

// =========================================================================
// SKILL MEMORY
// =========================================================================

/// Persisted behavioral memory of a skill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillMemory {
    pub skill_name: String,
    pub memory: Vec<String>,
    pub error_history: Vec<String>,
    /// Incremented on every approved change
    pub revision: u64,
    pub updated_at: Option<DateTime<Utc>>,
    /// Ids of proposals already folded into this memory
    #[serde(default)]
    pub applied_proposals: Vec<String>,
}

impl SkillMemory {
    pub fn empty(skill_name: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            ..Default::default()
        }
    }

    /// Apply an approved proposal's additions.
    pub fn append(&mut self, memory_addition: &str, history_entry: &str, at: DateTime<Utc>) {
        self.memory.push(memory_addition.to_string());
        self.error_history.push(history_entry.to_string());
        self.revision += 1;
        self.updated_at = Some(at);
    }

    pub fn has_applied(&self, proposal_id: &str) -> bool {
        self.applied_proposals.iter().any(|id| id == proposal_id)
    }

    /// Append a proposal's additions once. Returns `false` if this proposal
    /// was already applied.
    pub fn apply_proposal(&mut self, proposal: &ImprovementProposal, at: DateTime<Utc>) -> bool {
        if self.has_applied(&proposal.id) {
            return false;
        }
        self.append(
            &proposal.proposed_memory_addition,
            &proposal.proposed_history_entry,
            at,
        );
        self.applied_proposals.push(proposal.id.clone());
        true
    }

    /// Memory rendered as a bullet list for prompts.
    pub fn render(&self) -> String {
        if self.memory.is_empty() {
            return "(no memory yet)".to_string();
        }
        self.memory
            .iter()
            .map(|m| format!("- {}", m))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(name: &str, is_error: bool) -> ToolSpan {
        ToolSpan {
            name: name.to_string(),
            sanitized_input: serde_json::json!({}),
            output_summary: String::new(),
            duration_ms: 1,
            is_error,
            started_at: Utc::now(),
        }
    }

    fn proposal() -> ImprovementProposal {
        ImprovementProposal {
            id: "p-1".to_string(),
            skill_name: "search".to_string(),
            error_summary: "timeout".to_string(),
            error_normalized: "timeout".to_string(),
            error_full: "timeout after 30s".to_string(),
            proposed_memory_addition: "Retry with a smaller query".to_string(),
            proposed_history_entry: "search timed out".to_string(),
            source: ProposalSource::Fallback,
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            approver_id: None,
            rejection_reason: None,
        }
    }

    #[test]
    fn test_tier_ordering_and_limits() {
        assert!(Tier::Admin > Tier::Developer);
        assert!(Tier::Developer > Tier::User);
        assert!(Tier::User > Tier::Guest);
        assert_eq!(Tier::Guest.default_rate_limit(), Some(10));
        assert_eq!(Tier::User.default_rate_limit(), Some(30));
        assert_eq!(Tier::Developer.default_rate_limit(), Some(100));
        assert_eq!(Tier::Admin.default_rate_limit(), None);
    }

    #[test]
    fn test_tier_parse_fails_closed() {
        assert_eq!(Tier::parse_or_guest("Admin"), Tier::Admin);
        assert_eq!(Tier::parse_or_guest("superuser"), Tier::Guest);
        assert_eq!(Tier::parse_or_guest(""), Tier::Guest);
    }

    #[test]
    fn test_span_cap_degrades_trace() {
        let mut trace = ExecutionTrace::new("t-1", None, None, false);
        assert!(trace.push_span(span("a", false), 2));
        assert!(trace.push_span(span("b", false), 2));
        assert!(!trace.push_span(span("c", false), 2));
        assert!(!trace.push_span(span("d", false), 2));

        assert_eq!(trace.child_spans.len(), 2);
        assert_eq!(trace.dropped_spans, 2);
        assert_eq!(trace.status, TraceStatus::Degraded);

        trace.finish(TraceStatus::Success);
        assert_eq!(trace.status, TraceStatus::Degraded);
        assert_eq!(trace.metadata.get("dropped_spans").map(String::as_str), Some("2"));
        assert!(trace.should_persist());
    }

    #[test]
    fn test_error_outcome_overrides_degraded() {
        let mut trace = ExecutionTrace::new("t-2", None, None, false);
        trace.push_span(span("a", true), 0);
        trace.finish(TraceStatus::Error);
        assert_eq!(trace.status, TraceStatus::Error);
    }

    #[test]
    fn test_unsampled_success_not_persisted() {
        let mut trace = ExecutionTrace::new("t-3", None, None, false);
        trace.finish(TraceStatus::Success);
        assert!(!trace.should_persist());

        let mut sampled = ExecutionTrace::new("t-4", None, None, true);
        sampled.finish(TraceStatus::Success);
        assert!(sampled.should_persist());
    }

    #[test]
    fn test_proposal_resolves_once() {
        let mut p = proposal();
        assert!(p.approve("alice", Utc::now()));
        assert!(!p.approve("alice", Utc::now()));
        assert!(!p.reject("bob", "nope", Utc::now()));
        assert_eq!(p.status, ProposalStatus::Approved);
        assert_eq!(p.approver_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_skill_memory_append() {
        let mut memory = SkillMemory::empty("search");
        assert_eq!(memory.render(), "(no memory yet)");

        memory.append("Prefer short queries", "2026-01-01: timeout", Utc::now());
        assert_eq!(memory.revision, 1);
        assert_eq!(memory.render(), "- Prefer short queries");
        assert_eq!(memory.error_history.len(), 1);
    }

    #[test]
    fn test_identical_proposals_apply_separately() {
        let mut memory = SkillMemory::empty("search");
        let first = proposal();
        let second = ImprovementProposal {
            id: "p-2".to_string(),
            ..proposal()
        };

        assert!(memory.apply_proposal(&first, Utc::now()));
        assert!(memory.apply_proposal(&second, Utc::now()));
        assert!(!memory.apply_proposal(&first, Utc::now()));
        assert_eq!(memory.error_history.len(), 2);
        assert_eq!(memory.revision, 2);
        assert_eq!(memory.applied_proposals, vec!["p-1".to_string(), "p-2".to_string()]);
    }

    #[test]
    fn test_skill_memory_without_applied_ids_loads() {
        let memory: SkillMemory = serde_json::from_value(serde_json::json!({
            "skill_name": "search",
            "memory": ["Prefer short queries"],
            "error_history": ["timeout"],
            "revision": 1,
            "updated_at": null
        }))
        .unwrap();
        assert!(memory.applied_proposals.is_empty());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TraceStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let status: ProposalStatus = serde_json::from_str("\"rejected\"").unwrap();
        assert_eq!(status, ProposalStatus::Rejected);
    }
}
