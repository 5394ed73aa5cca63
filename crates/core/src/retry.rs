//! Pure redelivery policy for retry-queue entries.

use serde::{Deserialize, Serialize};

use crate::model::QueuedLocationSample;
use crate::time::EpochMs;

/// Limits applied to every queued entry on each processor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Entries with `retry_count >= max_retries` are dropped.
    pub max_retries: u32,
    /// Entries older than this are dropped regardless of retry count.
    pub max_age_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_age_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// What the processor does with one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Too old; drop without sending.
    Expired,
    /// Retry budget spent; drop without sending.
    Exhausted,
    /// Still eligible; attempt delivery.
    Attempt,
}

impl RetryPolicy {
    /// Age is checked before the retry budget.
    pub fn decide(&self, entry: &QueuedLocationSample, now: EpochMs) -> RetryDecision {
        if entry.age_ms(now) > self.max_age_ms {
            RetryDecision::Expired
        } else if entry.retry_count >= self.max_retries {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Attempt
        }
    }
}
