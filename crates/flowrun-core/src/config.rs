// Decision: RunnerConfig abstracts the dispatch decision and timing knobs.
// Configuration is via env vars: EXECUTIONS_MODE ("regular" default, or
// "queue"), EXECUTIONS_TIMEOUT / EXECUTIONS_MAX_TIMEOUT (seconds),
// QUEUE_RECOVERY_INTERVAL (seconds, 0 disables the watchdog).

use anyhow::Result;
use std::time::Duration;

/// Global execution dispatch mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionsMode {
    /// All executions run in-process (default)
    #[default]
    Regular,
    /// Non-manual executions are handed to the distributed job queue
    Queue,
}

impl std::str::FromStr for ExecutionsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "regular" | "" => Ok(ExecutionsMode::Regular),
            "queue" => Ok(ExecutionsMode::Queue),
            _ => anyhow::bail!("Unknown executions mode: {}. Use 'regular' or 'queue'", s),
        }
    }
}

/// Configuration for the execution orchestrator
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Dispatch mode: regular (in-process) or queue
    pub executions_mode: ExecutionsMode,
    /// Default soft timeout in seconds for workflows without their own;
    /// <= 0 disables the timeout
    pub default_timeout_secs: i64,
    /// Upper bound in seconds that per-workflow timeouts are clamped to
    pub max_timeout_secs: i64,
    /// Watchdog poll interval in seconds for queued executions;
    /// 0 disables the recovery poll
    pub queue_recovery_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            executions_mode: ExecutionsMode::Regular,
            default_timeout_secs: -1,
            max_timeout_secs: 3600,
            queue_recovery_interval_secs: 60,
        }
    }
}

impl RunnerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let executions_mode = std::env::var("EXECUTIONS_MODE")
            .unwrap_or_default()
            .parse()?;

        let defaults = Self::default();

        let default_timeout_secs = match std::env::var("EXECUTIONS_TIMEOUT") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.default_timeout_secs,
        };
        let max_timeout_secs = match std::env::var("EXECUTIONS_MAX_TIMEOUT") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.max_timeout_secs,
        };
        let queue_recovery_interval_secs = match std::env::var("QUEUE_RECOVERY_INTERVAL") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.queue_recovery_interval_secs,
        };

        Ok(Self {
            executions_mode,
            default_timeout_secs,
            max_timeout_secs,
            queue_recovery_interval_secs,
        })
    }

    /// Effective soft timeout for a workflow, clamped to the global maximum.
    /// None means the timeout is disabled.
    pub fn effective_timeout(&self, workflow_timeout_secs: Option<i64>) -> Option<Duration> {
        let timeout = workflow_timeout_secs.unwrap_or(self.default_timeout_secs);
        if timeout <= 0 {
            return None;
        }
        Some(Duration::from_secs(
            timeout.min(self.max_timeout_secs).max(0) as u64,
        ))
    }

    /// Watchdog poll interval; None when the recovery poll is disabled
    pub fn queue_recovery_interval(&self) -> Option<Duration> {
        if self.queue_recovery_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.queue_recovery_interval_secs))
        }
    }
}
