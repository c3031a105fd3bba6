//! Retry policy for forge calls.
//!
//! Exponential backoff with full jitter, capped per attempt and bounded by a
//! per-transition deadline. A forge-supplied retry-after hint overrides the
//! computed delay; only `Transient` errors are retried.

use super::models::RetrySettings;
use crate::forge::ForgeError;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Total budget for the transition, external calls plus sleeps.
    pub budget: Duration,
}

impl RetryConfig {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            factor: settings.factor,
            max_delay: Duration::from_millis(settings.max_delay_ms),
            budget: Duration::from_secs(settings.budget_seconds),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// One policy instance covers one transition: the deadline is fixed at
/// construction so every wrapped call shares the same budget.
pub struct RetryPolicy {
    config: RetryConfig,
    deadline: Instant,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let deadline = Instant::now() + config.budget;
        Self { config, deadline }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run `operation` until it succeeds, fails non-transiently, or the
    /// budget would be exceeded by the next sleep.
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, ForgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ForgeError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let hint = match &error {
                        ForgeError::Transient { retry_after, .. } => *retry_after,
                        _ => return Err(error),
                    };
                    let delay = self.delay_for(attempt, hint);
                    if Instant::now() + delay >= self.deadline {
                        warn!(
                            operation = name,
                            attempt,
                            "retry budget exhausted: {error}"
                        );
                        return Err(error);
                    }
                    warn!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off: {error}"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        // The forge knows its own quota; a retry-after hint wins outright.
        if let Some(hint) = hint {
            return hint;
        }
        let exp = self.config.base_delay.as_secs_f64() * self.config.factor.powi(attempt as i32 - 1);
        let capped = exp.min(self.config.max_delay.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_config() -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(5),
            factor: 2.0,
            max_delay: Duration::from_millis(20),
            budget: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(quick_config());
        let c = counter.clone();

        let result = policy
            .run("op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ForgeError::transient("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(quick_config());
        let c = counter.clone();

        let result: Result<(), ForgeError> = policy
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ForgeError::permanent("404"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_bounds_retries() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(50),
            factor: 2.0,
            max_delay: Duration::from_millis(50),
            budget: Duration::from_millis(120),
        };
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(config);
        let c = counter.clone();

        let result: Result<(), ForgeError> = policy
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ForgeError::transient("down"))
                }
            })
            .await;

        assert!(result.is_err());
        // The budget allows only a handful of 0..=50ms sleeps.
        assert!(counter.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_retry_after_hint_overrides_backoff() {
        let policy = RetryPolicy::new(quick_config());
        let started = Instant::now();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = policy
            .run("op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ForgeError::rate_limited(
                            "429",
                            Duration::from_millis(200),
                        ))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
