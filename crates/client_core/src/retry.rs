use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::RetrySettings;

/// Backoff policy for throttled idempotent requests.
///
/// Attempt `n` (1-indexed) waits at least `base * 2^(n-1) + jitter`, and never less
/// than a server-supplied `Retry-After`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    jitter_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, jitter_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            jitter_ms,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1_u64 << shift))
    }

    /// Uniform in `[0, jitter_ms)`.
    pub fn sample_jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..self.jitter_ms))
    }

    pub fn delay_for_attempt(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        jitter: Duration,
    ) -> Duration {
        let computed = self.base_delay(attempt) + jitter;
        match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            settings.base_delay_ms,
            settings.jitter_ms,
        )
    }
}

/// Parses a `Retry-After` value: delta-seconds, or an HTTP date relative to `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        let secs = value.parse::<u64>().ok()?;
        return Some(Duration::from_millis(secs.saturating_mul(1000)));
    }
    let target = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
    Some(remaining)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn base_delays_double_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn jitter_stays_below_bound() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            assert!(policy.sample_jitter() < Duration::from_millis(250));
        }
        assert_eq!(RetryPolicy::new(3, 500, 0).sample_jitter(), Duration::ZERO);
    }

    #[test]
    fn delay_never_drops_below_floor_or_hint() {
        let policy = RetryPolicy::default();
        for attempt in 1..=3 {
            let jitter = policy.sample_jitter();
            let delay = policy.delay_for_attempt(attempt, None, jitter);
            assert!(delay >= policy.base_delay(attempt));
            assert_eq!(delay, policy.base_delay(attempt) + jitter);
        }
        assert_eq!(
            policy.delay_for_attempt(1, Some(Duration::from_secs(2)), Duration::from_millis(10)),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for_attempt(3, Some(Duration::from_millis(100)), Duration::ZERO),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::default();
        assert!(!policy.allows_attempt(0));
        assert!(policy.allows_attempt(1));
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));
        assert!(!RetryPolicy::new(0, 500, 250).allows_attempt(1));
    }

    #[test]
    fn retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("2", now), Some(Duration::from_millis(2000)));
        assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("", now), None);
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:05 GMT", now),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now),
            Some(Duration::ZERO)
        );
    }
}
