//! Retry strategies and backoff policies for forest workers.
//!
//! Durable consumers redeliver after handler failures, and the decomposer
//! retries compare-and-set conflicts against Soil; both take their pacing
//! from this crate. Supported backoff strategies: immediate, exponential,
//! linear, constant, each with optional jitter to avoid thundering herds.
//!
//! # Example
//!
//! ```
//! use nimsforest_retry::{RetryStrategyConfig, calculate_delay};
//! use std::time::Duration;
//!
//! let config = RetryStrategyConfig {
//!     max_attempts: 5,
//!     base_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(5),
//!     ..Default::default()
//! };
//! let delay = calculate_delay(&config, 2);
//! assert!(delay <= config.max_delay);
//! ```

use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay increases linearly each attempt.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap applied to every calculated delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = none, 1.0 = up to the full delay again).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Calculate the delay before the given attempt (1-based).
///
/// Attempt 1 is the first retry. The un-jittered delay is capped at
/// `max_delay`; jitter then adds up to `jitter * delay` on top, capped again.
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let base = base_delay_for(config, attempt);
    let capped = base.min(config.max_delay);

    if config.jitter <= 0.0 || capped.is_zero() {
        return capped;
    }

    let jitter_span = capped.as_secs_f64() * config.jitter.min(1.0);
    let jittered = capped.as_secs_f64() + rand::rng().random_range(0.0..=jitter_span);
    Duration::from_secs_f64(jittered).min(config.max_delay)
}

fn base_delay_for(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Constant => config.base_delay,
        RetryStrategyType::Linear => {
            config.base_delay.saturating_mul(attempt)
        }
        RetryStrategyType::Exponential => {
            let shift = (attempt - 1).min(32);
            config.base_delay.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
        }
    }
}

/// Whether another attempt is allowed after `attempt` attempts have run.
pub fn should_retry(config: &RetryStrategyConfig, attempt: u32) -> bool {
    attempt < config.max_attempts
}
