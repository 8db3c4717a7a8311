//! Agent Configuration
//!
//! Loop bounds, retry policy and tool execution limits. Values come from
//! code (`Default` / [`crate::reasoning::AgentBuilder`]), from any serde
//! source, or from `AGENT_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// How often, and how patiently, retryable provider errors are retried
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Re-queries allowed after the first attempt (K)
    pub max_retries: u32,
    /// Wait before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound on any single wait
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, at most `max_retries` times
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Wait before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let millis = (self.initial_backoff_ms as f64) * self.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = capped.round() as u64;
        Duration::from_millis(millis)
    }
}

/// Agent configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum provider round-trips per turn before giving up
    pub max_iterations: usize,

    /// Retry policy for retryable provider errors
    pub retry: RetryPolicy,

    /// Upper bound on tool invocations running at once within one step
    pub tool_concurrency: usize,

    /// Per-invocation executor time limit
    pub tool_timeout_ms: Option<u64>,

    /// Token budget for the history handed to the provider
    pub max_context_tokens: Option<u32>,

    /// Prepended as a system message to sessions created by the agent
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            retry: RetryPolicy::default(),
            tool_concurrency: 4,
            tool_timeout_ms: None,
            max_context_tokens: None,
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    /// Load from `AGENT_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup (environment, secrets store, test map)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Result<Option<T>> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| AgentError::Config(format!("{key}: cannot parse '{raw}'"))),
            }
        }

        let mut config = Self::default();
        if let Some(v) = parse(&lookup, "AGENT_MAX_ITERATIONS")? {
            config.max_iterations = v;
        }
        if let Some(v) = parse(&lookup, "AGENT_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse(&lookup, "AGENT_RETRY_BACKOFF_MS")? {
            config.retry.initial_backoff_ms = v;
        }
        if let Some(v) = parse(&lookup, "AGENT_RETRY_MAX_BACKOFF_MS")? {
            config.retry.max_backoff_ms = v;
        }
        if let Some(v) = parse(&lookup, "AGENT_RETRY_MULTIPLIER")? {
            config.retry.multiplier = v;
        }
        if let Some(v) = parse(&lookup, "AGENT_TOOL_CONCURRENCY")? {
            config.tool_concurrency = v;
        }
        config.tool_timeout_ms = parse(&lookup, "AGENT_TOOL_TIMEOUT_MS")?;
        config.max_context_tokens = parse(&lookup, "AGENT_MAX_CONTEXT_TOKENS")?;
        config.system_prompt = lookup("AGENT_SYSTEM_PROMPT").filter(|s| !s.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        if self.tool_concurrency == 0 {
            return Err(AgentError::Config("tool_concurrency must be at least 1".into()));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(AgentError::Config("retry.multiplier must be a finite number >= 1".into()));
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_ms.map(Duration::from_millis)
    }
}
