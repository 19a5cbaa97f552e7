//! Exponential backoff and the retry ceiling.

use std::time::Duration;

use outbox_store::{OutboxConfig, OutboxEvent};

/// Where a failed attempt sends the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Back to PENDING, due again after `delay`.
    Retry { retry_count: i32, delay: Duration },
    /// Retry budget spent; terminal.
    Fail { retry_count: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &OutboxConfig) -> Self {
        Self::new(config.base_retry_delay, config.max_retry_delay)
    }

    /// `base * 2^retry_count`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        self.base_delay
            .checked_mul(2u32.pow(exponent))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// The transition for a failed attempt on `event`.
    ///
    /// The attempt counts first; the event fails once the new count exceeds
    /// its `max_retries`. A ceiling of `n` therefore allows `n + 1` attempts.
    pub fn after_failure(&self, event: &OutboxEvent) -> Transition {
        let retry_count = event.retry_count.saturating_add(1);
        if retry_count > event.max_retries {
            Transition::Fail { retry_count }
        } else {
            Transition::Retry {
                retry_count,
                delay: self.delay_for(retry_count),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outbox_store::EventStatus;
    use uuid::Uuid;

    fn event(retry_count: i32, max_retries: i32) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: Uuid::new_v4(),
            event_type: "order.created".into(),
            payload: serde_json::json!({}),
            status: EventStatus::Processing,
            retry_count,
            max_retries,
            next_run_at: now,
            last_error: None,
            created_at: now,
            claimed_at: Some(now),
            processed_at: None,
        }
    }

    #[test]
    fn delay_doubles_per_retry() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
    }

    #[test]
    fn delay_is_capped_and_never_overflows() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
        assert_eq!(policy.delay_for(i32::MAX), Duration::from_secs(60));

        let huge = RetryPolicy::new(Duration::from_secs(u64::MAX / 2), Duration::MAX);
        assert_eq!(huge.delay_for(31), Duration::MAX);
    }

    #[test]
    fn delay_is_monotonic() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(90));
        let delays: Vec<_> = (0..50).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn failures_retry_until_the_ceiling_is_exceeded() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(3600));

        assert_eq!(
            policy.after_failure(&event(0, 5)),
            Transition::Retry {
                retry_count: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.after_failure(&event(4, 5)),
            Transition::Retry {
                retry_count: 5,
                delay: Duration::from_secs(32)
            }
        );
        assert_eq!(
            policy.after_failure(&event(5, 5)),
            Transition::Fail { retry_count: 6 }
        );
    }

    #[test]
    fn zero_ceiling_fails_on_first_error() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.after_failure(&event(0, 0)),
            Transition::Fail { retry_count: 1 }
        );
    }
}
