//! Reflection prompt and response handling.
//!
//! The reflection step asks the model for two short strings:
//! a memory line the skill should follow from now on, and a history entry
//! recording what went wrong. Anything unusable falls back to a
//! deterministic proposal built from the error text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::{truncate, SkillMemory};

use crate::providers::ChatMessage;

/// System prompt for the reflection call.
pub const REFLECTION_SYSTEM_PROMPT: &str = r#"
You maintain the behavioral memory of one skill of a chat assistant.

A skill just failed. Propose ONE correction that would have prevented the
failure, phrased as an instruction the skill follows from now on.

## Rules
1. Address the failure shown, not hypothetical ones
2. Do not repeat an instruction already present in the current memory
3. Keep each field to a single sentence
4. Never include credentials, user data or identifiers

## Output Format (JSON only, no prose)
{
  "memory_addition": "instruction the skill follows from now on",
  "history_entry": "one-line record of what failed and why"
}
"#;

/// Longest memory addition or history entry accepted from the model.
const MAX_FIELD_CHARS: usize = 500;

/// A proposed correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflection {
    pub memory_addition: String,
    pub history_entry: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReflectionParseError {
    #[error("no JSON object in response")]
    NoJson,

    #[error("invalid reflection JSON: {0}")]
    Invalid(String),

    #[error("reflection field '{0}' is empty")]
    EmptyField(&'static str),
}

/// Messages for one reflection call.
pub fn reflection_messages(
    skill_name: &str,
    memory: &SkillMemory,
    error: &str,
    context: &BTreeMap<String, String>,
) -> Vec<ChatMessage> {
    let mut prompt = format!(
        "## Skill\n{}\n\n## Current memory\n{}\n\n## Error\n{}\n",
        skill_name,
        memory.render(),
        truncate(error, 2_000)
    );
    if !context.is_empty() {
        prompt.push_str("\n## Context\n");
        for (key, value) in context {
            prompt.push_str(&format!("- {}: {}\n", key, truncate(value, 200)));
        }
    }

    vec![
        ChatMessage::system(REFLECTION_SYSTEM_PROMPT.trim()),
        ChatMessage::user(prompt),
    ]
}

/// Parse the model's answer. Tolerates code fences and surrounding prose.
pub fn parse_reflection(raw: &str) -> Result<Reflection, ReflectionParseError> {
    let start = raw.find('{').ok_or(ReflectionParseError::NoJson)?;
    let end = raw.rfind('}').ok_or(ReflectionParseError::NoJson)?;
    if end < start {
        return Err(ReflectionParseError::NoJson);
    }

    let parsed: Reflection = serde_json::from_str(&raw[start..=end])
        .map_err(|e| ReflectionParseError::Invalid(e.to_string()))?;

    let memory_addition = parsed.memory_addition.trim();
    let history_entry = parsed.history_entry.trim();
    if memory_addition.is_empty() {
        return Err(ReflectionParseError::EmptyField("memory_addition"));
    }
    if history_entry.is_empty() {
        return Err(ReflectionParseError::EmptyField("history_entry"));
    }

    Ok(Reflection {
        memory_addition: truncate(memory_addition, MAX_FIELD_CHARS),
        history_entry: truncate(history_entry, MAX_FIELD_CHARS),
    })
}

/// Deterministic proposal used when reflection is unavailable.
pub fn fallback_reflection(skill_name: &str, error_summary: &str) -> Reflection {
    Reflection {
        memory_addition: format!(
            "Before finishing '{}', check for this failure and report it clearly instead of guessing: {}",
            skill_name, error_summary
        ),
        history_entry: format!("{} failed: {}", skill_name, error_summary),
    }
}
