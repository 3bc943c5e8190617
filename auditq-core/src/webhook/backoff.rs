use std::time::Duration;

use rand::Rng;

use crate::config::WebhookConfig;

/// Exponential backoff for webhook redelivery: `base * 2^(attempts-1)`,
/// capped, then jittered uniformly into `[d/2, d]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(3_600),
        }
    }
}

impl From<&WebhookConfig> for BackoffPolicy {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            base: Duration::from_secs(config.backoff_base_secs),
            max: Duration::from_secs(config.backoff_max_secs),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number `attempts`,
    /// without jitter.
    pub fn nominal(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn delay(&self, attempts: i32) -> Duration {
        let nominal = self.nominal(attempts);
        let secs = nominal.as_secs_f64();
        if secs <= 0.0 {
            return nominal;
        }
        let jittered = rand::rng().random_range(secs / 2.0..=secs);
        Duration::from_secs_f64(jittered)
    }
}
