//! Retry configuration, deserialized from the `[retry]` config table

use std::time::Duration;

use check_core::FailureClass;
use serde::Deserialize;

/// Backoff schedule for one failure class.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassPolicy {
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl ClassPolicy {
    pub const fn new(base_delay_secs: f64, max_delay_secs: f64, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
            multiplier,
            max_attempts,
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_secs)
    }

    fn validate(&self, name: &str) -> common::Result<()> {
        let finite = [self.base_delay_secs, self.max_delay_secs, self.multiplier]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.base_delay_secs <= 0.0 || self.max_delay_secs < self.base_delay_secs {
            return Err(common::Error::Config(format!(
                "retry.{name}: need 0 < base_delay_secs <= max_delay_secs"
            )));
        }
        if self.multiplier < 1.0 {
            return Err(common::Error::Config(format!(
                "retry.{name}: multiplier must be at least 1.0"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,
}

fn default_breaker_threshold() -> u32 {
    10
}

fn default_breaker_timeout() -> u64 {
    300
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            timeout_secs: default_breaker_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Timeouts and unclassified failures.
    #[serde(default = "default_general")]
    pub general: ClassPolicy,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: ClassPolicy,
    /// Network and connection failures.
    #[serde(default = "default_network")]
    pub network: ClassPolicy,
    #[serde(default = "default_server")]
    pub server: ClassPolicy,
    /// Symmetric jitter as a fraction of the computed delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_general() -> ClassPolicy {
    ClassPolicy::new(1.0, 60.0, 2.0, 3)
}

fn default_rate_limit() -> ClassPolicy {
    ClassPolicy::new(5.0, 300.0, 2.0, 5)
}

fn default_network() -> ClassPolicy {
    ClassPolicy::new(0.5, 30.0, 2.0, 3)
}

fn default_server() -> ClassPolicy {
    ClassPolicy::new(2.0, 120.0, 2.0, 4)
}

fn default_jitter_factor() -> f64 {
    0.3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            general: default_general(),
            rate_limit: default_rate_limit(),
            network: default_network(),
            server: default_server(),
            jitter_factor: default_jitter_factor(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Schedule that applies to a failure class.
    pub fn for_class(&self, class: FailureClass) -> &ClassPolicy {
        match class {
            FailureClass::RateLimited => &self.rate_limit,
            FailureClass::Network | FailureClass::Connection => &self.network,
            FailureClass::Server => &self.server,
            FailureClass::Timeout | FailureClass::Unknown => &self.general,
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        self.general.validate("general")?;
        self.rate_limit.validate("rate_limit")?;
        self.network.validate("network")?;
        self.server.validate("server")?;
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(common::Error::Config(format!(
                "retry.jitter_factor must be in [0, 1), got: {}",
                self.jitter_factor
            )));
        }
        if self.breaker.threshold == 0 {
            return Err(common::Error::Config(
                "retry.breaker.threshold must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
