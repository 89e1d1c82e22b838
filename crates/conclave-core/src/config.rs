use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};

/// Top-level Conclave configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConclaveConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub communication: CommunicationConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on tasks in `in_progress` at any instant.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Timeout applied to tasks created without one.
    #[serde(default = "default_task_timeout")]
    pub default_task_timeout_secs: u64,
    /// Poll interval for `wait_for_task`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Default retry policy for new tasks.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_task_timeout_secs: default_task_timeout(),
            poll_interval_ms: default_poll_interval(),
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Bounded retry with exponential backoff. `max_retries = 0` disables retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// How the executor walks a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalMode {
    /// Depth-first, one node at a time; the first handler error fails the run.
    #[default]
    Sequential,
    /// Successors run concurrently; handler errors end only their branch.
    Concurrent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub mode: TraversalMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            mode: TraversalMode::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationConfig {
    /// Default wait window for `send_and_wait`.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
    /// Upper bound on one delivery to a target agent.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: default_reply_timeout(),
            delivery_timeout_secs: default_delivery_timeout(),
        }
    }
}

impl CommunicationConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_max_concurrent_tasks() -> usize { 4 }
fn default_task_timeout() -> u64 { 300 }
fn default_poll_interval() -> u64 { 50 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30_000 }
fn default_reply_timeout() -> u64 { 30 }
fn default_delivery_timeout() -> u64 { 60 }
fn default_event_capacity() -> usize { 256 }

impl ConclaveConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConclaveError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ConclaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrent_tasks == 0 {
            return Err(ConclaveError::Config(
                "orchestrator.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.orchestrator.retry.initial_backoff_ms > self.orchestrator.retry.max_backoff_ms {
            return Err(ConclaveError::Config(
                "orchestrator.retry.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
