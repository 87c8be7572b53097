// src/dag/retry.rs

//! Exponential-backoff retry around a single unit of work.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{DagflowError, Result};

/// Absolute ceiling for the wait between two attempts, whatever the policy says.
pub const MAX_INTERVAL_CEILING: Duration = Duration::from_secs(150);

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Retry configuration attached to tasks and steps.
///
/// `max_attempts <= 0` disables retrying: the work runs exactly once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: i32,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_attempts: 0,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Fill zero values with defaults and clamp the interval cap.
    pub fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = DEFAULT_INTERVAL;
        }
        if self.max_interval.is_zero() {
            self.max_interval = DEFAULT_MAX_INTERVAL;
        }
        if self.max_interval > MAX_INTERVAL_CEILING {
            self.max_interval = MAX_INTERVAL_CEILING;
        }
        if self.multiplier <= 0.0 || !self.multiplier.is_finite() {
            self.multiplier = DEFAULT_MULTIPLIER;
        }
        self
    }

    /// Wait before the attempt following `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.multiplier.powi(exp);
        let cap = self.max_interval.min(MAX_INTERVAL_CEILING);
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Runs a closure of the attempt number until it succeeds, attempts run out,
/// or the cancellation token fires.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: String,
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// `None` resolves to the default policy, which runs once.
    pub fn new(name: impl Into<String>, policy: Option<RetryPolicy>) -> Self {
        Self {
            name: name.into(),
            policy: policy.unwrap_or_default().normalized(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1) as u32;
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(DagflowError::Cancelled {
                    unit: self.name.clone(),
                    attempt,
                });
            }

            let err = match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            // A unit reporting its own cancellation is not retried.
            if let Some(DagflowError::Cancelled { .. }) = err.downcast_ref::<DagflowError>() {
                return Err(DagflowError::Other(err));
            }

            if attempt >= max_attempts {
                return Err(DagflowError::RetryExhausted {
                    unit: self.name.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            let wait = self.policy.backoff(attempt);
            warn!(
                unit = %self.name,
                attempt,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "attempt failed; retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(unit = %self.name, attempt, "retry wait cancelled");
                    return Err(DagflowError::Cancelled {
                        unit: self.name.clone(),
                        attempt: attempt + 1,
                    });
                }
                _ = tokio::time::sleep(wait) => {}
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(350),
            max_attempts: 10,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1).as_millis(), 100);
        assert_eq!(policy.backoff(2).as_millis(), 200);
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn cap_never_exceeds_ceiling() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(100),
            max_interval: Duration::from_secs(3600),
            max_attempts: 5,
            multiplier: 3.0,
        }
        .normalized();
        assert_eq!(policy.max_interval, MAX_INTERVAL_CEILING);
        assert_eq!(policy.backoff(4), MAX_INTERVAL_CEILING);
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let policy = RetryPolicy {
            interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            max_attempts: 2,
            multiplier: 0.0,
        }
        .normalized();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(30));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[tokio::test]
    async fn non_positive_attempts_run_once() {
        let exec = RetryExecutor::new("once", Some(RetryPolicy::with_attempts(-1)));
        let mut calls = 0;
        let res: Result<()> = exec
            .execute(&CancellationToken::new(), |attempt| {
                calls += 1;
                async move { Err(anyhow::anyhow!("boom on {attempt}")) }
            })
            .await;
        assert_eq!(calls, 1);
        match res {
            Err(DagflowError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let exec = RetryExecutor::new("c", Some(RetryPolicy::with_attempts(3)));
        let res: Result<u8> = exec.execute(&token, |_| async { Ok(1) }).await;
        assert!(matches!(res, Err(DagflowError::Cancelled { attempt: 1, .. })));
    }

    #[tokio::test]
    async fn unit_reporting_cancellation_is_not_retried() {
        let exec = RetryExecutor::new("k", Some(RetryPolicy::with_attempts(5)));
        let mut calls = 0;
        let res: Result<()> = exec
            .execute(&CancellationToken::new(), |attempt| {
                calls += 1;
                async move {
                    Err(DagflowError::Cancelled {
                        unit: "k".into(),
                        attempt,
                    }
                    .into())
                }
            })
            .await;
        assert_eq!(calls, 1);
        assert!(res.unwrap_err().to_string().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts_follow_the_backoff() {
        let exec = RetryExecutor::new(
            "timed",
            Some(RetryPolicy {
                interval: Duration::from_millis(10),
                max_interval: Duration::from_secs(1),
                max_attempts: 3,
                multiplier: 2.0,
            }),
        );
        let mut stamps = Vec::new();
        let res: Result<()> = exec
            .execute(&CancellationToken::new(), |attempt| {
                stamps.push(tokio::time::Instant::now());
                async move { Err(anyhow::anyhow!("fail {attempt}")) }
            })
            .await;

        assert!(matches!(res, Err(DagflowError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(stamps.len(), 3);
        let first = stamps[1] - stamps[0];
        let second = stamps[2] - stamps[1];
        assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(12), "{first:?}");
        assert!(second >= Duration::from_millis(20) && second < Duration::from_millis(22), "{second:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_returns_at_once() {
        let exec = RetryExecutor::new(
            "slow",
            Some(RetryPolicy {
                interval: Duration::from_secs(60),
                max_interval: Duration::from_secs(120),
                max_attempts: 3,
                multiplier: 2.0,
            }),
        );
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let started = tokio::time::Instant::now();
        let mut calls = 0;
        let res: Result<()> = exec
            .execute(&token, |_| {
                calls += 1;
                async { Err(anyhow::anyhow!("down")) }
            })
            .await;

        assert_eq!(calls, 1);
        assert!(matches!(res, Err(DagflowError::Cancelled { attempt: 2, .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        canceller.await.unwrap();
    }
}
