//! Engine configuration, deserialized from the `[engine]` config table

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrent workers. The session uses
    /// `min(max_workers, code count)`.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Requeues allowed per code for rate-limited or credential failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-task join timeout on stop.
    #[serde(default = "default_worker_join_timeout")]
    pub worker_join_timeout_secs: u64,
    /// Overall budget for joining every task on stop.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_max_workers() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_worker_join_timeout() -> u64 {
    3
}

fn default_stop_timeout() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            worker_join_timeout_secs: default_worker_join_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_join_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config(
                "engine.max_workers must be greater than 0".into(),
            ));
        }
        if self.worker_join_timeout_secs == 0 || self.stop_timeout_secs == 0 {
            return Err(Error::Config(
                "engine join and stop timeouts must be greater than 0".into(),
            ));
        }
        if self.worker_join_timeout_secs > self.stop_timeout_secs {
            return Err(Error::Config(format!(
                "engine.worker_join_timeout_secs ({}) exceeds engine.stop_timeout_secs ({})",
                self.worker_join_timeout_secs, self.stop_timeout_secs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.worker_join_timeout(), Duration::from_secs(3));
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_table_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn zero_workers_rejected() {
        let config: EngineConfig = toml::from_str("max_workers = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"), "got: {err}");
    }

    #[test]
    fn join_timeout_cannot_exceed_stop_budget() {
        let config = EngineConfig {
            worker_join_timeout_secs: 20,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
