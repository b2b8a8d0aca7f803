//! Bounded retry for a single stage call.
//!
//! Every attempt runs under the call timeout; a timeout counts as a
//! retryable failure. Retryable failures are retried with exponential
//! backoff until the policy runs out, at which point the last failure is
//! reported as Fatal. Fatal failures are returned at once. Tokens spent by
//! failed attempts are summed so the caller can bill them.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::StageError;
use crate::llm::{Billed, TokenCost};
use crate::pipeline::types::StageKind;

/// Computes exponential backoff with optional jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Delay before retry number `attempt + 1` (0-based `attempt`).
    pub fn delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let pow = policy.backoff_multiplier.powi(attempt as i32);
        let delay_ms = ((policy.initial_backoff_ms as f32 * pow) as u64).min(policy.max_backoff_ms);

        let jitter = policy.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 && delay_ms > 0 {
            let scale: f32 = rand::thread_rng().gen_range(-jitter..=jitter);
            let jitter_ms = (delay_ms as f32 * scale).round() as i64;
            let adjusted = (delay_ms as i64 + jitter_ms).max(0) as u64;
            return Duration::from_millis(adjusted);
        }
        Duration::from_millis(delay_ms)
    }
}

/// Outcome of a retried call, with the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StageError>,
    pub calls: u32,
    /// Cost of the attempts that failed. A timed-out attempt adds nothing.
    pub spent: TokenCost,
}

/// Run `op` under `timeout`, retrying retryable failures per `policy`.
pub async fn call_with_retry<T, Op, Fut>(
    stage: StageKind,
    policy: &RetryPolicy,
    timeout: Duration,
    mut op: Op,
) -> Attempted<T>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Billed<StageError>>>,
{
    let total = policy.max_retries.saturating_add(1);
    let mut attempt: u32 = 0;
    let mut spent = TokenCost::zero();

    loop {
        let outcome = match tokio::time::timeout(timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(Billed::free(StageError::retryable(
                stage,
                format!("call timed out after {}ms", timeout.as_millis()),
            ))),
        };
        let calls = attempt + 1;

        let error = match outcome {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    calls,
                    spent,
                };
            }
            Err(Billed { error, cost }) => {
                spent += cost;
                error
            }
        };
        let reason = match error {
            StageError::Retryable { reason, .. } => reason,
            other => {
                return Attempted {
                    result: Err(other),
                    calls,
                    spent,
                };
            }
        };

        if calls >= total {
            warn!(stage = %stage, attempts = calls, reason = %reason, "Retries exhausted");
            return Attempted {
                result: Err(StageError::fatal(
                    stage,
                    format!("gave up after {calls} attempts: {reason}"),
                )),
                calls,
                spent,
            };
        }

        let delay = BackoffCalculator::delay(policy, attempt);
        debug!(
            stage = %stage,
            attempt = calls,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Retrying stage call"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use rust_decimal_macros::dec;

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 250,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_progression_is_capped() {
        let p = policy(5);
        assert_eq!(BackoffCalculator::delay(&p, 0), Duration::from_millis(100));
        assert_eq!(BackoffCalculator::delay(&p, 1), Duration::from_millis(200));
        assert_eq!(BackoffCalculator::delay(&p, 2), Duration::from_millis(250));
        assert_eq!(BackoffCalculator::delay(&p, 9), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = RetryPolicy {
            jitter_factor: 0.5,
            max_backoff_ms: 10_000,
            ..policy(5)
        };
        for _ in 0..50 {
            let d = BackoffCalculator::delay(&p, 2).as_millis() as f32;
            assert!((199.0..=601.0).contains(&d));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = call_with_retry(
            StageKind::Classifier,
            &policy(2),
            Duration::from_secs(1),
            move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Billed::free(StageError::retryable(StageKind::Classifier, "503")))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(out.result.unwrap(), 42);
        assert_eq!(out.calls, 3);
        assert!(out.spent.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_fatal() {
        let out: Attempted<()> = call_with_retry(
            StageKind::Writer,
            &policy(2),
            Duration::from_secs(1),
            |_| async {
                Err(Billed::free(StageError::retryable(
                    StageKind::Writer,
                    "rate limited",
                )))
            },
        )
        .await;
        assert_eq!(out.calls, 3);
        let err = out.result.unwrap_err();
        assert!(matches!(err, StageError::Fatal { .. }));
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_not_retried() {
        let out: Attempted<()> = call_with_retry(
            StageKind::Writer,
            &policy(2),
            Duration::from_secs(1),
            |_| async { Err(Billed::free(StageError::fatal(StageKind::Writer, "auth failed"))) },
        )
        .await;
        assert_eq!(out.calls, 1);
        assert!(matches!(out.result, Err(StageError::Fatal { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = call_with_retry(
            StageKind::Retrieval,
            &policy(1),
            Duration::from_millis(50),
            move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok("done")
                }
            },
        )
        .await;
        assert_eq!(out.result.unwrap(), "done");
        assert_eq!(out.calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_billed() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = call_with_retry(
            StageKind::Writer,
            &policy(2),
            Duration::from_secs(1),
            move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Billed::new(
                            StageError::retryable(StageKind::Writer, "malformed model output"),
                            TokenCost::priced(200, 100, (dec!(0.000003), dec!(0.000015))),
                        ))
                    } else {
                        Ok("draft")
                    }
                }
            },
        )
        .await;
        assert_eq!(out.result.unwrap(), "draft");
        assert_eq!(out.spent.input_tokens, 400);
        assert_eq!(out.spent.usd, dec!(0.0042));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_still_report_spend() {
        let out: Attempted<()> = call_with_retry(
            StageKind::QualityGate,
            &policy(1),
            Duration::from_secs(1),
            |_| async {
                Err(Billed::new(
                    StageError::retryable(StageKind::QualityGate, "unparseable output"),
                    TokenCost::priced(10, 5, (dec!(0.001), dec!(0.001))),
                ))
            },
        )
        .await;
        assert!(matches!(out.result, Err(StageError::Fatal { .. })));
        assert_eq!(out.calls, 2);
        assert_eq!(out.spent.output_tokens, 10);
    }
}
