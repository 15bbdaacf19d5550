use rand::Rng;
use std::time::Duration;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Bounded exponential backoff between reconnect attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up. 0 retries forever.
    pub max_retries: u32,
    /// Scale each delay by a random factor in 0.8..=1.2.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            max_retries: DEFAULT_MAX_RETRIES,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Short, deterministic delays for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 1.5,
            max_retries,
            jitter: false,
        }
    }

    /// Delay before the attempt following `failures` consecutive failures.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_backoff.as_millis() as f64);
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.8..=1.2)
        } else {
            1.0
        };
        Duration::from_millis((capped_ms * factor) as u64)
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        self.max_retries == 0 || failures < self.max_retries
    }
}
