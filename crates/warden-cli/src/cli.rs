use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use warden_core::{ProposalStatus, Tier, TraceStatus};

#[derive(Parser, Debug)]
#[command(name = "warden", about = "Inspect and operate a Warden store", version)]
pub struct Cli {
    /// YAML config file; defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// JSON store file shared with the agent
    #[arg(long, global = true, default_value = "warden-store.json")]
    pub store: PathBuf,

    /// Raise log level to debug
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Improvement proposals
    #[command(subcommand)]
    Proposals(ProposalCommand),

    /// Persisted skill memory
    #[command(subcommand)]
    Skills(SkillCommand),

    /// User authorization tiers
    #[command(subcommand)]
    Tiers(TierCommand),

    /// Stored execution traces
    #[command(subcommand)]
    Traces(TraceCommand),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Load and validate the config, print the effective values
    Check,
    /// Print the default config
    Defaults,
}

#[derive(Subcommand, Debug)]
pub enum ProposalCommand {
    List {
        #[arg(long)]
        skill: Option<String>,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[command(flatten)]
        window: Window,
    },
    Show {
        id: String,
    },
    Approve {
        id: String,
        #[arg(long)]
        approver: String,
    },
    Reject {
        id: String,
        #[arg(long)]
        approver: String,
        #[arg(long, default_value = "rejected by operator")]
        reason: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SkillCommand {
    Show { name: String },
}

#[derive(Subcommand, Debug)]
pub enum TierCommand {
    Get {
        user: String,
    },
    Set {
        user: String,
        #[arg(value_enum)]
        tier: TierArg,
    },
}

#[derive(Subcommand, Debug)]
pub enum TraceCommand {
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, value_enum)]
        status: Option<TraceStatusArg>,
        #[command(flatten)]
        window: Window,
    },
    Show {
        id: String,
    },
}

/// Time window and size of a listing.
#[derive(Args, Debug, Clone)]
pub struct Window {
    /// Only entries newer than this, e.g. `1h`, `7d`
    #[arg(long)]
    pub since: Option<humantime::Duration>,

    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StatusArg {
    Pending,
    Approved,
    Rejected,
}

impl From<StatusArg> for ProposalStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => ProposalStatus::Pending,
            StatusArg::Approved => ProposalStatus::Approved,
            StatusArg::Rejected => ProposalStatus::Rejected,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum TraceStatusArg {
    Success,
    Error,
    Timeout,
    Degraded,
}

impl From<TraceStatusArg> for TraceStatus {
    fn from(arg: TraceStatusArg) -> Self {
        match arg {
            TraceStatusArg::Success => TraceStatus::Success,
            TraceStatusArg::Error => TraceStatus::Error,
            TraceStatusArg::Timeout => TraceStatus::Timeout,
            TraceStatusArg::Degraded => TraceStatus::Degraded,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum TierArg {
    Guest,
    User,
    Developer,
    Admin,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Guest => Tier::Guest,
            TierArg::User => Tier::User,
            TierArg::Developer => Tier::Developer,
            TierArg::Admin => Tier::Admin,
        }
    }
}
