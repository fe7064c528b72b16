//! Retry policy: decides back-off delays between staging retries.

use chrono::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::StagingConfig;

/// Back-off for failed staging stages.
///
/// delay = base × n², with n = max_retries − retries_left (at least 1),
/// scaled by a uniform factor in [0.5, 1.5).
///
/// Example with base=10s, max_retries=10 (before jitter):
/// - retries_left 9: 10s
/// - retries_left 8: 40s
/// - retries_left 7: 90s
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_secs: u64,
    rng: StdRng,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_secs: u64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            max_retries,
            base_secs,
            rng,
        }
    }

    pub fn from_config(staging: &StagingConfig) -> Self {
        Self::new(
            staging.max_retries,
            staging.retry_base_secs,
            staging.retry_seed,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the next attempt, given the budget left after the
    /// failure was counted. Never zero.
    pub fn backoff(&mut self, retries_left: u32) -> Duration {
        let n = u64::from(self.max_retries.saturating_sub(retries_left).max(1));
        let base_ms = self.base_secs.saturating_mul(1000).saturating_mul(n * n);
        let factor: f64 = self.rng.gen_range(0.5..1.5);
        let ms = (base_ms as f64 * factor) as i64;
        Duration::milliseconds(ms.max(1000))
    }
}
