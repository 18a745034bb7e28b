use crate::error::RunError;

/// Exponential backoff used when a run function fails.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval_ms: i64,
    pub max_interval_ms: i64,
    pub backoff_factor: f64,
    /// Jitter the delay into [delay, 2*delay)
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 10_000,
            max_interval_ms: 24 * 60 * 60 * 1_000,
            backoff_factor: 2.0,
            randomize: false,
        }
    }
}

/// Maps an attempt number to the next attempt time.
pub type BackoffFn = std::sync::Arc<dyn Fn(u32, i64) -> i64 + Send + Sync>;

impl RetryPolicy {
    /// Time (epoch ms) of the next attempt after `attempt` (0-based) failed at `now_ms`.
    pub fn next_attempt_ms(&self, attempt: u32, now_ms: i64) -> i64 {
        let mut delay =
            (self.initial_interval_ms as f64 * self.backoff_factor.powi(attempt as i32)).round() as i64;
        if self.randomize {
            delay = (delay as f64 * (1.0 + rand::random::<f64>())).round() as i64;
        }
        now_ms.saturating_add(delay.clamp(0, self.max_interval_ms))
    }

    pub fn into_backoff_fn(self) -> BackoffFn {
        std::sync::Arc::new(move |attempt, now_ms| self.next_attempt_ms(attempt, now_ms))
    }
}

/// Whether a failed attempt gets another try.
pub fn should_retry(err: &RunError, attempt: u32, max_attempts: u32) -> bool {
    if err.quit {
        return false;
    }
    if err.always_retryable {
        return true;
    }
    err.retryable && attempt + 1 < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let p = RetryPolicy {
            initial_interval_ms: 100,
            max_interval_ms: 10_000,
            backoff_factor: 2.0,
            randomize: false,
        };
        assert_eq!(p.next_attempt_ms(0, 1_000), 1_100);
        assert_eq!(p.next_attempt_ms(3, 1_000), 1_800);
        assert_eq!(p.next_attempt_ms(20, 0), 10_000);
    }

    #[test]
    fn retry_decisions() {
        let e = RunError::retryable("boom");
        assert!(should_retry(&e, 0, 4));
        assert!(should_retry(&e, 2, 4));
        assert!(!should_retry(&e, 3, 4));
        assert!(!should_retry(&RunError::permanent("no"), 0, 4));
        assert!(should_retry(&RunError::always_retryable("again"), 10, 4));
        assert!(!should_retry(&RunError::quit("stop"), 0, 4));
    }
}
