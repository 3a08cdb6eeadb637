// src/utils/retry.rs

//! Retry policy shared by the fetcher and the notification dispatcher.
//!
//! Attempt `n` (1-based) that fails with a retryable error is followed by a
//! sleep of `base * multiplier^(n-1)`, spread by a random jitter fraction.
//! The cancellation token is checked before every attempt and during sleeps.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::models::{FetcherConfig, NotifierConfig};

/// Retry parameters for one call site.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.0 disables)
    pub jitter: f64,
}

/// Why the policy stopped retrying.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// The last attempt's error, with the number of attempts made
    Exhausted { error: E, attempts: u32 },
    /// A non-retryable error ended the loop early
    Permanent { error: E, attempts: u32 },
    /// The token was cancelled between attempts
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Permanent { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and one-shot calls.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn for_fetcher(config: &FetcherConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn for_notifier(config: &NotifierConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay after the given failed attempt, before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.base_delay.mul_f64(self.multiplier.max(1.0).powi(exponent))
    }

    /// Delay after the given failed attempt, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor.max(0.0))
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts or `cancel` fires.
    ///
    /// `on_retry` is awaited after each retryable failure that will be
    /// retried, with the failed attempt number, the error and the delay.
    pub async fn run<T, E, Op, Fut, Pred, Hook, HookFut>(
        &self,
        cancel: &CancellationToken,
        is_retryable: Pred,
        mut on_retry: Hook,
        mut operation: Op,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Pred: Fn(&E) -> bool,
        Hook: FnMut(u32, &E, Duration) -> HookFut,
        HookFut: Future<Output = ()>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(RetryError::Permanent {
                    error,
                    attempts: attempt,
                });
            }
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.delay(attempt);
            on_retry(attempt, &error, delay).await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_hook(_: u32, _: &&'static str, _: Duration) -> std::future::Ready<()> {
        std::future::ready(())
    }

    #[test]
    fn test_backoff_shape() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(1500));
        assert_eq!(policy.delay(3), Duration::from_millis(2250));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            jitter: 0.2,
        };
        for _ in 0..50 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::immediate(3);
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy
            .run(
                &CancellationToken::new(),
                |_: &&str| true,
                no_hook,
                |attempt| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if attempt < 3 { Err("flaky") } else { Ok(attempt) }
                    }
                },
            )
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), _> = policy
            .run(
                &CancellationToken::new(),
                |_: &&str| true,
                no_hook,
                |_| async { Err("down") },
            )
            .await;
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                error: "down",
                attempts: 3
            })
        );
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), _> = policy
            .run(
                &CancellationToken::new(),
                |_: &&str| false,
                no_hook,
                |_| async { Err("not found") },
            )
            .await;
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let policy = RetryPolicy::immediate(3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<&str>> = policy
            .run(&cancel, |_: &&str| true, no_hook, |_| async { Ok(()) })
            .await;
        assert_eq!(result, Err(RetryError::Cancelled { attempts: 0 }));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: 0.0,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result: Result<(), _> = policy
            .run(
                &cancel,
                |_: &&str| true,
                move |_, _, _| {
                    trigger.cancel();
                    async {}
                },
                |_| async { Err("timeout") },
            )
            .await;
        assert_eq!(result, Err(RetryError::Cancelled { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_on_retry_sees_each_retry() {
        let policy = RetryPolicy::immediate(3);
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let _: Result<(), _> = policy
            .run(
                &CancellationToken::new(),
                |_: &&str| true,
                move |_, _, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {}
                },
                |_| async { Err("down") },
            )
            .await;
        // Three attempts, two retries.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
