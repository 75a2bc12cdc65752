use std::time::Duration;

/// Exponential restart policy for the relay process.
///
/// Attempt `k` (0-based) waits `base * 2^k` before the next launch, clamped to
/// `max_delay` when set. With `max_retries = Some(n)` the relay gives up after
/// the n-th restart has failed; `None` retries forever.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: None,
            max_retries: None,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// True once `attempt` restarts have already been used up.
    pub fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_retries, Some(max) if attempt >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_the_base() {
        let backoff = Backoff {
            base: Duration::from_secs(3),
            ..Backoff::default()
        };
        let delays: Vec<u64> = (0..5).map(|k| backoff.delay(k).as_secs()).collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 48]);
    }

    #[test]
    fn delay_is_clamped_and_never_overflows() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(60)),
            max_retries: None,
        };
        assert_eq!(backoff.delay(10), Duration::from_secs(60));
        assert_eq!(backoff.delay(200), Duration::from_secs(60));

        let unclamped = Backoff::default();
        assert_eq!(unclamped.delay(200), Duration::MAX);
    }

    #[test]
    fn retry_cap_is_optional() {
        let capped = Backoff {
            max_retries: Some(2),
            ..Backoff::default()
        };
        assert!(!capped.exhausted(0));
        assert!(!capped.exhausted(1));
        assert!(capped.exhausted(2));
        assert!(!Backoff::default().exhausted(u32::MAX));
    }
}
