//! Retry and exponential backoff

use crate::config::WorkerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue, eligible again at `next_attempt_epoch`
    Retry { retries: u32, next_attempt_epoch: i64 },
    /// Retry budget spent; the task fails for good
    Exhausted { retries: u32 },
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base_secs: u64, backoff_max_secs: u64) -> Self {
        Self {
            max_retries,
            backoff_base_secs,
            backoff_max_secs,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.max_retries,
            config.backoff_base_secs,
            config.backoff_max_secs,
        )
    }

    /// `min(max, base * 2^(retries - 1))`, for `retries >= 1`
    pub fn backoff_secs(&self, retries: u32) -> u64 {
        let exponent = retries.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        self.backoff_base_secs
            .saturating_mul(factor)
            .min(self.backoff_max_secs)
    }

    /// Decide what follows a failure, given the retries recorded before it
    pub fn decide(&self, previous_retries: u32, now_epoch: i64) -> RetryDecision {
        let retries = previous_retries.saturating_add(1);
        if retries > self.max_retries {
            return RetryDecision::Exhausted { retries };
        }
        let delay = i64::try_from(self.backoff_secs(retries)).unwrap_or(i64::MAX);
        RetryDecision::Retry {
            retries,
            next_attempt_epoch: now_epoch.saturating_add(delay),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}
