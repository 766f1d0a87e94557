//! Reconnect delay policy.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Exponential backoff with a ceiling: `min(base * 2^attempt, max)`, plus
/// optional random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Give up after this many reconnect cycles; `None` retries forever
  pub max_attempts: Option<u32>,
  /// Upper bound of extra random delay added to each wait
  pub jitter: Duration,
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
      max_attempts: None,
      jitter: Duration::ZERO,
    }
  }
}

impl ReconnectPolicy {
  /// Delay before reconnect number `attempt` (zero-based), without jitter.
  pub fn base_delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// Delay before reconnect number `attempt`, jitter included.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    jittered(self.base_delay_for(attempt), self.jitter)
  }

  pub fn attempts_exhausted(&self, attempt: u32) -> bool {
    self.max_attempts.is_some_and(|max| attempt >= max)
  }
}

fn jittered(base: Duration, jitter: Duration) -> Duration {
  let jitter_ms = jitter.as_millis() as u64;
  if jitter_ms == 0 {
    return base;
  }
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_else(|_| Duration::from_nanos(0))
    .subsec_nanos() as u64;
  base.saturating_add(Duration::from_millis(nanos % jitter_ms))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy(base_ms: u64, max_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy {
      base_delay: Duration::from_millis(base_ms),
      max_delay: Duration::from_millis(max_ms),
      ..ReconnectPolicy::default()
    }
  }

  #[test]
  fn test_delay_doubles_until_ceiling() {
    let policy = policy(1000, 30_000);
    let delays: Vec<u64> = (0..8)
      .map(|n| policy.base_delay_for(n).as_millis() as u64)
      .collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000, 30_000]);
  }

  #[test]
  fn test_delay_sequence_non_decreasing_and_capped() {
    let policy = policy(250, 10_000);
    let mut previous = Duration::ZERO;
    for attempt in 0..100 {
      let delay = policy.base_delay_for(attempt);
      assert!(delay >= previous);
      assert!(delay <= policy.max_delay);
      previous = delay;
    }
  }

  #[test]
  fn test_huge_attempt_does_not_overflow() {
    let policy = policy(1000, 5000);
    assert_eq!(policy.base_delay_for(u32::MAX), Duration::from_millis(5000));
  }

  #[test]
  fn test_jitter_stays_within_bound() {
    let policy = ReconnectPolicy {
      jitter: Duration::from_millis(50),
      ..policy(100, 1000)
    };
    for attempt in 0..10 {
      let base = policy.base_delay_for(attempt);
      let delay = policy.delay_for(attempt);
      assert!(delay >= base);
      assert!(delay < base + Duration::from_millis(50));
    }
  }

  #[test]
  fn test_attempt_limit() {
    let unlimited = ReconnectPolicy::default();
    assert!(!unlimited.attempts_exhausted(1_000_000));

    let limited = ReconnectPolicy {
      max_attempts: Some(3),
      ..ReconnectPolicy::default()
    };
    assert!(!limited.attempts_exhausted(2));
    assert!(limited.attempts_exhausted(3));
  }
}
