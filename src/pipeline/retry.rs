//! Retry classification for dead-lettered enrichment deliveries.
//!
//! Attempts are not looped locally: each retry is a fresh delivery after the broker's delay
//! queue releases it, so the state is recomputed from the redelivery count every time.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Fresh,
    /// The n-th redelivery, `1 <= n < max_retries`.
    Retry(u32),
    Exhausted,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay the broker applies before a rejected delivery comes back.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    #[must_use]
    pub const fn classify(&self, redeliveries: u32) -> RetryState {
        if redeliveries >= self.max_retries {
            RetryState::Exhausted
        } else if redeliveries == 0 {
            RetryState::Fresh
        } else {
            RetryState::Retry(redeliveries)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_policy_allows_three_redeliveries() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.classify(0), RetryState::Fresh);
        assert_eq!(policy.classify(1), RetryState::Retry(1));
        assert_eq!(policy.classify(2), RetryState::Retry(2));
        assert_eq!(policy.classify(3), RetryState::Exhausted);
        assert_eq!(policy.classify(40), RetryState::Exhausted);
        assert_eq!(policy.backoff(), Duration::from_secs(10));
    }

    proptest! {
        #[test]
        fn exhaustion_is_reached_exactly_at_max(max in 1_u32..20, n in 0_u32..40) {
            let policy = RetryPolicy::new(max, Duration::ZERO);
            let exhausted = policy.classify(n) == RetryState::Exhausted;
            prop_assert_eq!(exhausted, n >= max);
        }
    }
}
