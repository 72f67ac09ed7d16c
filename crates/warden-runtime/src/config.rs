//! Runtime configuration.
//!
//! Every section is defaulted, so an empty YAML document is a valid
//! configuration. Durations are written the human way (`"30s"`, `"5m"`,
//! `"24h"`).
//!
//! ```yaml
//! breakers:
//!   defaults:
//!     failure_threshold: 5
//!     cooldown: 30s
//!   overrides:
//!     llm:
//!       failure_threshold: 3
//!       timeout: 20s
//! state:
//!   namespaces:
//!     search_results:
//!       ttl: 2m
//! trace:
//!   success_sample_rate: 0.1
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::Tier;

use crate::resilience::CircuitBreakerConfig;

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serde adapter for `Duration` as a humantime string.
pub(crate) mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Same as [`humantime_duration`] for optional fields.
pub(crate) mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::humantime_duration::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub breakers: BreakerSettings,
    pub state: StateConfig,
    pub trace: TraceConfig,
    pub improvement: ImprovementConfig,
}

impl WardenConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject settings that would disable a safety bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let breaker_configs = std::iter::once(("defaults", &self.breakers.defaults)).chain(
            self.breakers
                .overrides
                .iter()
                .map(|(name, cfg)| (name.as_str(), cfg)),
        );
        for (name, cfg) in breaker_configs {
            if cfg.failure_threshold == 0 {
                return Err(invalid(format!("breaker '{}': failure_threshold must be > 0", name)));
            }
            if cfg.half_open_probe_count == 0 {
                return Err(invalid(format!(
                    "breaker '{}': half_open_probe_count must be > 0",
                    name
                )));
            }
            if cfg.timeout.is_zero() {
                return Err(invalid(format!("breaker '{}': timeout must be > 0", name)));
            }
        }

        if self.state.rate_window.is_zero() {
            return Err(invalid("state.rate_window must be > 0"));
        }
        if self.state.rate_shards == 0 {
            return Err(invalid("state.rate_shards must be > 0"));
        }
        if self.state.sweep_interval.is_zero() {
            return Err(invalid("state.sweep_interval must be > 0"));
        }
        for (ns, cfg) in &self.state.namespaces {
            if cfg.sweep_interval.is_some_and(|d| d.is_zero()) {
                return Err(invalid(format!("state.namespaces.{}: sweep_interval must be > 0", ns)));
            }
        }

        if !(0.0..=1.0).contains(&self.trace.success_sample_rate) {
            return Err(invalid("trace.success_sample_rate must be within [0, 1]"));
        }
        if self.trace.max_child_spans == 0 {
            return Err(invalid("trace.max_child_spans must be > 0"));
        }

        if self.improvement.queue_capacity == 0 {
            return Err(invalid("improvement.queue_capacity must be > 0"));
        }
        if self.improvement.dedup_prefix_len == 0 {
            return Err(invalid("improvement.dedup_prefix_len must be > 0"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Circuit breaker settings per dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Applied to every dependency without an override
    pub defaults: CircuitBreakerConfig,

    /// Dependencies registered at startup
    pub dependencies: Vec<String>,

    /// Full replacement settings for named dependencies
    pub overrides: BTreeMap<String, CircuitBreakerConfig>,
}

impl BreakerSettings {
    /// Effective settings for a dependency.
    pub fn for_dependency(&self, name: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Every dependency name that gets a breaker: the declared list plus
    /// anything with an override.
    pub fn all_dependencies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dependencies.clone();
        for name in self.overrides.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            defaults: CircuitBreakerConfig::default(),
            dependencies: vec!["llm".to_string(), "search".to_string(), "store".to_string()],
            overrides: BTreeMap::new(),
        }
    }
}

/// Per-namespace cache settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// TTL used when `set` is called without one
    #[serde(with = "humantime_duration_opt", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,

    /// How often this namespace's expired L1 entries are swept
    #[serde(with = "humantime_duration_opt", skip_serializing_if = "Option::is_none")]
    pub sweep_interval: Option<Duration>,
}

/// Requests per rate window by tier. Admin is always unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub guest: u32,
    pub user: u32,
    pub developer: u32,
}

impl RateLimits {
    pub fn limit_for(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::Guest => Some(self.guest),
            Tier::User => Some(self.user),
            Tier::Developer => Some(self.developer),
            Tier::Admin => None,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            guest: Tier::Guest.default_rate_limit().unwrap_or(10),
            user: Tier::User.default_rate_limit().unwrap_or(30),
            developer: Tier::Developer.default_rate_limit().unwrap_or(100),
        }
    }
}

/// State manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Base interval of the L1 sweeper
    #[serde(with = "humantime_duration")]
    pub sweep_interval: Duration,

    /// TTL for namespaces without their own
    #[serde(with = "humantime_duration")]
    pub default_ttl: Duration,

    pub namespaces: BTreeMap<String, NamespaceConfig>,

    #[serde(with = "humantime_duration")]
    pub tier_cache_ttl: Duration,

    pub tier_cache_capacity: u64,

    #[serde(with = "humantime_duration")]
    pub rate_window: Duration,

    pub rate_limits: RateLimits,

    /// Lock shards for rate counters
    pub rate_shards: usize,
}

impl StateConfig {
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.ttl)
            .unwrap_or(self.default_ttl)
    }

    pub fn sweep_interval_for(&self, namespace: &str) -> Duration {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.sweep_interval)
            .unwrap_or(self.sweep_interval)
    }

    /// Tick of the sweeper task: the shortest configured interval.
    pub fn sweep_tick(&self) -> Duration {
        self.namespaces
            .values()
            .filter_map(|ns| ns.sweep_interval)
            .fold(self.sweep_interval, Duration::min)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            default_ttl: Duration::from_secs(600),
            namespaces: BTreeMap::new(),
            tier_cache_ttl: Duration::from_secs(300),
            tier_cache_capacity: 10_000,
            rate_window: Duration::from_secs(60),
            rate_limits: RateLimits::default(),
            rate_shards: 16,
        }
    }
}

/// Execution trace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Fraction of successful traces persisted
    pub success_sample_rate: f64,

    pub max_child_spans: usize,

    /// Maximum characters kept per recorded value
    pub max_value_len: usize,

    /// How long persisted traces are kept
    #[serde(with = "humantime_duration")]
    pub retention: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            success_sample_rate: 0.1,
            max_child_spans: 1000,
            max_value_len: 512,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Improvement pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementConfig {
    pub max_proposals_per_window: usize,

    #[serde(with = "humantime_duration")]
    pub rate_window: Duration,

    #[serde(with = "humantime_duration")]
    pub dedup_window: Duration,

    /// Characters of the normalized error compared for dedup
    pub dedup_prefix_len: usize,

    #[serde(with = "humantime_duration")]
    pub reflect_timeout: Duration,

    pub queue_capacity: usize,

    /// Who is notified about new proposals
    pub approver_id: Option<String>,

    pub min_approver_tier: Tier,

    /// Model used for reflection
    pub model: String,

    pub max_tokens: u32,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            max_proposals_per_window: 3,
            rate_window: Duration::from_secs(3600),
            dedup_window: Duration::from_secs(24 * 3600),
            dedup_prefix_len: 120,
            reflect_timeout: Duration::from_secs(20),
            queue_capacity: 256,
            approver_id: None,
            min_approver_tier: Tier::Developer,
            model: "claude-sonnet-4-5-20250514".to_string(),
            max_tokens: 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = WardenConfig::from_yaml_str("").unwrap();
        assert_eq!(config.breakers.defaults.failure_threshold, 5);
        assert_eq!(config.state.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.trace.max_child_spans, 1000);
        assert_eq!(config.improvement.max_proposals_per_window, 3);
        assert_eq!(config.state.rate_limits.limit_for(Tier::Admin), None);
    }

    #[test]
    fn test_humantime_durations_parse() {
        let yaml = r#"
breakers:
  overrides:
    llm:
      failure_threshold: 3
      cooldown: 45s
      timeout: 20s
state:
  default_ttl: 10m
  namespaces:
    search_results:
      ttl: 2m
      sweep_interval: 1m
improvement:
  dedup_window: 12h
"#;
        let config = WardenConfig::from_yaml_str(yaml).unwrap();
        let llm = config.breakers.for_dependency("llm");
        assert_eq!(llm.failure_threshold, 3);
        assert_eq!(llm.cooldown, Duration::from_secs(45));
        assert_eq!(llm.timeout, Duration::from_secs(20));

        assert_eq!(config.state.ttl_for("search_results"), Duration::from_secs(120));
        assert_eq!(config.state.ttl_for("other"), Duration::from_secs(600));
        assert_eq!(config.state.sweep_interval_for("search_results"), Duration::from_secs(60));
        assert_eq!(config.state.sweep_tick(), Duration::from_secs(60));
        assert_eq!(config.improvement.dedup_window, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_overrides_register_dependencies() {
        let yaml = r#"
breakers:
  dependencies: [llm]
  overrides:
    vector_search:
      failure_threshold: 2
"#;
        let config = WardenConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.breakers.all_dependencies(),
            vec!["llm".to_string(), "vector_search".to_string()]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_threshold = "breakers:\n  defaults:\n    failure_threshold: 0\n";
        assert!(matches!(
            WardenConfig::from_yaml_str(zero_threshold),
            Err(ConfigError::Invalid(_))
        ));

        let bad_rate = "trace:\n  success_sample_rate: 1.5\n";
        assert!(matches!(
            WardenConfig::from_yaml_str(bad_rate),
            Err(ConfigError::Invalid(_))
        ));

        let bad_duration = "state:\n  default_ttl: soon\n";
        assert!(matches!(
            WardenConfig::from_yaml_str(bad_duration),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_yaml_roundtrip_keeps_durations_readable() {
        let yaml = WardenConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("sweep_interval: 5m"));
        let reparsed = WardenConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(reparsed.state.default_ttl, Duration::from_secs(600));
    }
}
