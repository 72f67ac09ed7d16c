use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use warden_core::Tier;
use warden_runtime::improvement::{ImprovementPipeline, ProposalQuery};
use warden_runtime::trace::{TraceQuery, TraceStore};
use warden_runtime::{CircuitRegistry, JsonFileStore, StateManager, WardenConfig};

use crate::cli::{Cli, Command, ConfigCommand, ProposalCommand, SkillCommand, TierCommand, TraceCommand, Window};

/// What a command prints.
#[derive(Debug)]
pub enum Output {
    Json(Value),
    Yaml(String),
}

impl Output {
    pub fn render(&self) -> Result<String> {
        match self {
            Output::Json(value) => Ok(serde_json::to_string_pretty(value)?),
            Output::Yaml(text) => Ok(text.clone()),
        }
    }
}

/// Components opened over the store file.
struct Workspace {
    state: Arc<StateManager>,
    pipeline: ImprovementPipeline,
    traces: TraceStore,
}

impl Workspace {
    async fn open(config: &WardenConfig, path: &Path) -> Result<Self> {
        let store = Arc::new(
            JsonFileStore::open(path)
                .await
                .with_context(|| format!("opening store {}", path.display()))?,
        );
        let state = Arc::new(StateManager::new(config.state.clone(), store.clone()));
        let breakers = Arc::new(CircuitRegistry::from_settings(&config.breakers));
        let pipeline = ImprovementPipeline::new(config.improvement.clone(), Arc::clone(&state), breakers);
        let traces = TraceStore::new(store, config.trace.retention);
        tracing::debug!(path = %path.display(), "Store opened");
        Ok(Self {
            state,
            pipeline,
            traces,
        })
    }
}

fn load_config(path: Option<&Path>) -> Result<WardenConfig> {
    let config = match path {
        Some(path) => WardenConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => WardenConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn since(window: &Window) -> Result<Option<DateTime<Utc>>> {
    match window.since.as_deref() {
        Some(ago) => {
            let ago = chrono::Duration::from_std(*ago).context("--since is too large")?;
            Ok(Some(Utc::now() - ago))
        }
        None => Ok(None),
    }
}

pub async fn execute(cli: &Cli) -> Result<Output> {
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Command::Config(ConfigCommand::Check) => Ok(Output::Yaml(config.to_yaml()?)),
        Command::Config(ConfigCommand::Defaults) => Ok(Output::Yaml(WardenConfig::default().to_yaml()?)),
        Command::Proposals(cmd) => {
            let ws = Workspace::open(&config, &cli.store).await?;
            proposals(&ws, cmd).await
        }
        Command::Skills(SkillCommand::Show { name }) => {
            let ws = Workspace::open(&config, &cli.store).await?;
            match ws.pipeline.skills().load(name).await? {
                Some(memory) => Ok(Output::Json(serde_json::to_value(memory)?)),
                None => bail!("no memory stored for skill '{}'", name),
            }
        }
        Command::Tiers(cmd) => {
            let ws = Workspace::open(&config, &cli.store).await?;
            match cmd {
                TierCommand::Get { user } => {
                    let tier = ws.state.get_tier_cached(user).await;
                    Ok(Output::Json(json!({ "user_id": user, "tier": tier })))
                }
                TierCommand::Set { user, tier } => {
                    let tier = Tier::from(*tier);
                    ws.state.set_tier(user, tier).await?;
                    Ok(Output::Json(json!({ "user_id": user, "tier": tier })))
                }
            }
        }
        Command::Traces(cmd) => {
            let ws = Workspace::open(&config, &cli.store).await?;
            match cmd {
                TraceCommand::List {
                    user,
                    status,
                    window,
                } => {
                    let query = TraceQuery {
                        user_id: user.clone(),
                        status: status.map(Into::into),
                        since: since(window)?,
                        limit: window.limit,
                    };
                    Ok(Output::Json(serde_json::to_value(ws.traces.list(&query).await?)?))
                }
                TraceCommand::Show { id } => match ws.traces.load(id).await? {
                    Some(trace) => Ok(Output::Json(serde_json::to_value(trace)?)),
                    None => bail!("trace '{}' not found (expired or never persisted)", id),
                },
            }
        }
    }
}

async fn proposals(ws: &Workspace, cmd: &ProposalCommand) -> Result<Output> {
    match cmd {
        ProposalCommand::List {
            skill,
            status,
            window,
        } => {
            let query = ProposalQuery {
                skill_name: skill.clone(),
                status: status.map(Into::into),
                since: since(window)?,
                limit: window.limit,
            };
            let proposals = ws.pipeline.list_proposals(&query).await?;
            Ok(Output::Json(serde_json::to_value(proposals)?))
        }
        ProposalCommand::Show { id } => match ws.pipeline.get_proposal(id).await? {
            Some(proposal) => Ok(Output::Json(serde_json::to_value(proposal)?)),
            None => bail!("proposal '{}' not found", id),
        },
        ProposalCommand::Approve { id, approver } => {
            let applied = ws.pipeline.apply(id, approver).await?;
            resolved(ws, id, applied).await
        }
        ProposalCommand::Reject {
            id,
            approver,
            reason,
        } => {
            let rejected = ws.pipeline.reject(id, approver, reason).await?;
            resolved(ws, id, rejected).await
        }
    }
}

async fn resolved(ws: &Workspace, id: &str, changed: bool) -> Result<Output> {
    let proposal = ws.pipeline.get_proposal(id).await?;
    Ok(Output::Json(json!({
        "changed": changed,
        "proposal": proposal,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::BTreeMap;

    fn cli(store: &Path, args: &[&str]) -> Cli {
        let mut argv = vec!["warden", "--store", store.to_str().unwrap()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_render_as_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let out = execute(&cli(&dir.path().join("s.json"), &["config", "defaults"]))
            .await
            .unwrap();
        let rendered = out.render().unwrap();
        assert!(rendered.contains("failure_threshold: 5"));
        assert!(WardenConfig::from_yaml_str(&rendered).is_ok());
    }

    #[tokio::test]
    async fn test_approve_from_cli() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("s.json");
        let config = WardenConfig::default();

        let id = {
            let ws = Workspace::open(&config, &store).await.unwrap();
            ws.pipeline
                .analyze("weather", "KeyError: 'city'", &BTreeMap::new())
                .await
                .unwrap()
                .id
        };

        // Guests may not approve
        assert!(execute(&cli(&store, &["proposals", "approve", id.as_str(), "--approver", "ops"]))
            .await
            .is_err());

        execute(&cli(&store, &["tiers", "set", "ops", "developer"])).await.unwrap();
        let Output::Json(out) = execute(&cli(&store, &["proposals", "approve", id.as_str(), "--approver", "ops"]))
            .await
            .unwrap()
        else {
            panic!("expected JSON output");
        };
        assert_eq!(out["changed"], true);
        assert_eq!(out["proposal"]["status"], "approved");

        let Output::Json(memory) = execute(&cli(&store, &["skills", "show", "weather"])).await.unwrap() else {
            panic!("expected JSON output");
        };
        assert_eq!(memory["revision"], 1);

        let Output::Json(pending) = execute(&cli(&store, &["proposals", "list", "--status", "pending"]))
            .await
            .unwrap()
        else {
            panic!("expected JSON output");
        };
        assert_eq!(pending, json!([]));
    }

    #[tokio::test]
    async fn test_missing_trace_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute(&cli(&dir.path().join("s.json"), &["traces", "show", "nope"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
