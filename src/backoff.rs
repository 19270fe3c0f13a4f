//! Capped exponential backoff with jitter.
//!
//! Shared by the subscriber reconnect loop, the live feed client and the
//! time-series sink retry path.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `initial * 2^attempt`, capped at `max`, then scaled
/// by a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Relative jitter in [0, 1]
    pub jitter: f64,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self { initial, max, jitter }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 0.2)
    }
}
