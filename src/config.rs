//! Configuration management for the orchestrator.
//!
//! Configuration can be set via environment variables:
//! - `MAX_ITERATIONS` - Optional. Control-loop iteration cap. Defaults to `50`.
//! - `MAX_TASK_RETRIES` - Optional. Per-task retry threshold. Defaults to `3`.
//! - `MAX_INTERVENTIONS` - Optional. Run-wide intervention threshold. Defaults to `10`.
//! - `MAX_AGENT_ITERATIONS` - Optional. Sub-agent loop cap. Defaults to `20`.
//! - `CONTEXT_TOKEN_BUDGET` - Optional. Token budget for the message window.
//!   Defaults to `24000`. `0` disables budgeting.
//! - `KEEP_RECENT_MESSAGES` - Optional. Tail preserved by summarization. Defaults to `10`.
//! - `RUN_DEADLINE_SECS` - Optional. Wall-clock ceiling per run. Defaults to `600`.
//!   `0` disables the ceiling.
//! - `ORACLE_TEMPERATURE` - Optional. Sampling temperature. Defaults to `0.2`.
//! - `ORACLE_MAX_TOKENS` - Optional. Max completion tokens per oracle turn. Defaults to `4096`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum control-loop iterations per run.
    ///
    /// Reaching this cap is a fatal run error, not a task failure.
    pub max_iterations: u32,

    /// Maximum guard-approved retries per task node.
    pub max_task_retries: u32,

    /// Maximum guard-approved interventions per run.
    pub max_interventions: u32,

    /// Maximum iterations of a single sub-agent's decision loop.
    pub max_agent_iterations: u32,

    /// Token budget for system prompt + message window + tool menu.
    /// `0` disables budgeting entirely.
    pub context_token_budget: u64,

    /// Number of most-recent messages never folded into a digest.
    pub keep_recent_messages: usize,

    /// Wall-clock ceiling for a run, in seconds. `0` disables it.
    pub run_deadline_secs: u64,

    /// Sampling temperature for oracle calls.
    pub temperature: f64,

    /// Maximum completion tokens per oracle turn.
    pub max_response_tokens: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_task_retries: 3,
            max_interventions: 10,
            max_agent_iterations: 20,
            context_token_budget: 24_000,
            keep_recent_messages: 10,
            run_deadline_secs: 600,
            temperature: 0.2,
            max_response_tokens: 4096,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if a variable is set but does not
    /// parse as the expected type.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_iterations: parse_env("MAX_ITERATIONS", defaults.max_iterations)?,
            max_task_retries: parse_env("MAX_TASK_RETRIES", defaults.max_task_retries)?,
            max_interventions: parse_env("MAX_INTERVENTIONS", defaults.max_interventions)?,
            max_agent_iterations: parse_env("MAX_AGENT_ITERATIONS", defaults.max_agent_iterations)?,
            context_token_budget: parse_env("CONTEXT_TOKEN_BUDGET", defaults.context_token_budget)?,
            keep_recent_messages: parse_env("KEEP_RECENT_MESSAGES", defaults.keep_recent_messages)?,
            run_deadline_secs: parse_env("RUN_DEADLINE_SECS", defaults.run_deadline_secs)?,
            temperature: parse_env("ORACLE_TEMPERATURE", defaults.temperature)?,
            max_response_tokens: parse_env("ORACLE_MAX_TOKENS", defaults.max_response_tokens)?,
        })
    }

    /// Whether context budgeting is enabled.
    pub fn budgeting_enabled(&self) -> bool {
        self.context_token_budget > 0
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), value)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_iterations, 50);
        assert_eq!(cfg.max_task_retries, 3);
        assert!(cfg.budgeting_enabled());
    }

    #[test]
    fn env_override_parses() {
        std::env::set_var("CONCIERGE_TEST_ITERATIONS", "7");
        let value: u32 = parse_env("CONCIERGE_TEST_ITERATIONS", 50).unwrap();
        assert_eq!(value, 7);
        std::env::remove_var("CONCIERGE_TEST_ITERATIONS");
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        std::env::set_var("CONCIERGE_TEST_RETRIES", "lots");
        let err = parse_env::<u32>("CONCIERGE_TEST_RETRIES", 3).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "CONCIERGE_TEST_RETRIES"));
        std::env::remove_var("CONCIERGE_TEST_RETRIES");
    }
}
