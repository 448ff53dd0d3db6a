//! Exponential backoff shared by every reconnect and retry loop

use std::time::Duration;

/// Backoff policy: seed delay, cap, and growth factor
///
/// The same policy object drives the stream consumer (1s..30s), the
/// channel subscriber (1s..5m) and anything else that retries a
/// transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry, and the value restored after a success
    pub seed: Duration,
    /// Maximum delay cap
    pub max: Duration,
    /// Growth factor applied after every failure
    pub multiplier: u32,
}

impl BackoffPolicy {
    /// Policy used by the broker stream consumer
    pub const CONSUMER: Self = Self::new(Duration::from_secs(1), Duration::from_secs(30));

    /// Policy used by the reconnecting channel subscriber
    pub const SUBSCRIBER: Self = Self::new(Duration::from_secs(1), Duration::from_secs(300));

    /// Create a doubling policy
    #[must_use]
    pub const fn new(seed: Duration, max: Duration) -> Self {
        Self {
            seed,
            max,
            multiplier: 2,
        }
    }

    /// Start a fresh backoff sequence
    #[must_use]
    pub const fn start(self) -> Backoff {
        Backoff {
            policy: self,
            current: self.seed,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::CONSUMER
    }
}

/// Running backoff state for one retry loop
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// Delay to wait after a failure; advances the sequence
    ///
    /// Returns the current delay and grows the next one, capped at the
    /// policy maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.policy.max);
        self.current = self
            .current
            .saturating_mul(self.policy.multiplier)
            .min(self.policy.max);
        delay
    }

    /// Delay that the next failure would produce, without advancing
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.current.min(self.policy.max)
    }

    /// Reset to the seed delay after a success
    pub const fn reset(&mut self) {
        self.current = self.policy.seed;
    }

    /// The policy this backoff follows
    #[must_use]
    pub const fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}
