//! Named breakers, one per external dependency.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::config::BreakerSettings;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no circuit breaker registered for '{0}'")]
pub struct UnknownBreaker(pub String);

/// Registry of circuit breakers, built once at startup and shared by `Arc`.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One breaker per configured dependency, overrides applied.
    pub fn from_settings(settings: &BreakerSettings) -> Self {
        let mut registry = Self::new();
        for name in settings.all_dependencies() {
            let config = settings.for_dependency(&name);
            registry.register(name, config);
        }
        registry
    }

    /// Register (or replace) a breaker.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), config));
        tracing::debug!(breaker = %name, "Registered circuit breaker");
        self.breakers.insert(name, Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    pub fn breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>, UnknownBreaker> {
        self.get(name).ok_or_else(|| UnknownBreaker(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.breakers.keys().map(String::as_str).collect()
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        self.breakers.values().map(|b| b.snapshot()).collect()
    }

    /// Reset a breaker to closed. Returns false for unknown names.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
