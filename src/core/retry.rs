//! Bounded retry of external command invocations
//!
//! [`run_with_retry`] invokes an operation up to [`RetryPolicy::max_attempts`]
//! times, sleeping [`RetryPolicy::delay`] between attempts. The first success
//! is returned immediately; after the last attempt the final error is returned
//! as-is so callers still see the original failure.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Decides how many attempts are made and how long to wait between them
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Total attempts, including the first one (at least 1)
    fn max_attempts(&self) -> u32;

    /// Delay after failed attempt number `attempt` (1-based)
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay between every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for Fixed {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy for Fixed {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Doubling delay, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy for Backoff {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Base delay plus a random extra of up to the base again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jittered {
    pub attempts: u32,
    pub base: Duration,
}

impl RetryPolicy for Jittered {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn delay(&self, _attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let extra = rand::rng().random_range(0..=base_ms);
        self.base + Duration::from_millis(extra)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Fixed,
    Backoff,
    Jittered,
}

/// Serializable retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
            strategy: RetryStrategy::Fixed,
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

/// Upper bound for backoff delays
const BACKOFF_CAP: Duration = Duration::from_secs(30);

impl RetryConfig {
    pub fn build(&self) -> Box<dyn RetryPolicy> {
        let delay = Duration::from_millis(self.delay_ms);
        match self.strategy {
            RetryStrategy::Fixed => Box::new(Fixed {
                attempts: self.attempts,
                delay,
            }),
            RetryStrategy::Backoff => Box::new(Backoff {
                attempts: self.attempts,
                initial: delay,
                max: BACKOFF_CAP.max(delay),
            }),
            RetryStrategy::Jittered => Box::new(Jittered {
                attempts: self.attempts,
                base: delay,
            }),
        }
    }
}

/// Runs `op` under `policy`, returning the first success or the last error.
pub async fn run_with_retry<T, E, F, Fut>(policy: &dyn RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max => return Err(e),
            Err(e) => {
                let delay = policy.delay(attempt);
                debug!("Attempt {attempt}/{max} failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NO_DELAY: Fixed = Fixed {
        attempts: 3,
        delay: Duration::ZERO,
    };

    #[tokio::test]
    async fn test_first_success_returns_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = run_with_retry(&NO_DELAY, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_later_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = run_with_retry(&NO_DELAY, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_last_error_surfaces_unchanged() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = run_with_retry(&NO_DELAY, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("fail {n}"))
        })
        .await;

        assert_eq!(result, Err("fail 3".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_between_attempts_only() {
        let policy = Fixed::default();
        let start = tokio::time::Instant::now();
        let result: Result<(), &str> = run_with_retry(&policy, || async { Err("nope") }).await;

        assert!(result.is_err());
        // Two sleeps for three attempts
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = Fixed {
            attempts: 0,
            delay: Duration::ZERO,
        };
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = Backoff {
            attempts: 6,
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = Jittered {
            attempts: 3,
            base: Duration::from_millis(50),
        };
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_retry_config_defaults() {
        let cfg: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RetryConfig::default());
        let policy = cfg.build();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
    }
}
