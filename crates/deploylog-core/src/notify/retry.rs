//! Delivery retry policy.
//!
//! Defines how many delivery attempts a notification gets and how long to
//! wait between them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff policy for notification delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of delivery attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Multiplier applied for each further attempt (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without waiting. Used by tests and dry runs.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Calculate the delay that follows a failed attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}


mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

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
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
