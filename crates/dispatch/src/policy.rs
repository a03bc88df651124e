//! Delivery backoff and dispatcher settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Delay before the second attempt; doubles for each one after.
    pub base_delay: Duration,

    /// Cap on any single delay.
    pub max_delay: Duration,

    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,

    /// Budget for the whole delivery, retries included.
    pub deadline: Duration,
}

impl DeliveryPolicy {
    pub const DEFAULT: Self = Self {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(30),
        max_attempts: 10,
        deadline: Duration::from_secs(90),
    };

    pub fn new(base_delay: Duration, max_attempts: u32, deadline: Duration) -> Self {
        Self { base_delay, max_attempts, deadline, ..Self::DEFAULT }
    }

    /// Delay after failed attempt `attempt` (0-indexed): `base_delay * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The `[dispatch]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    #[serde(with = "polling::duration::serde_str")]
    pub base_delay: Duration,

    pub max_attempts: u32,

    /// Upper bound on one delivery attempt.
    #[serde(with = "polling::duration::serde_str")]
    pub request_timeout: Duration,

    /// Upper bound on a whole delivery. Must stay below the reconcile deadline.
    #[serde(with = "polling::duration::serde_str")]
    pub delivery_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_delay: DeliveryPolicy::DEFAULT.base_delay,
            max_attempts: DeliveryPolicy::DEFAULT.max_attempts,
            request_timeout: Duration::from_secs(30),
            delivery_timeout: DeliveryPolicy::DEFAULT.deadline,
        }
    }
}

impl DispatchConfig {
    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::new(self.base_delay, self.max_attempts, self.delivery_timeout)
    }
}
