//! Bounded retry driven by error classification.
//!
//! [`retry`] wraps a single-attempt operation in an iterative loop. Whether
//! another attempt is made, how long to wait first, and whether a final
//! failure is reported at all are decided by the attempt's
//! [`ClassifiedError`] flags, never by a blind attempt count:
//!
//! | `allow_retry` | budget left | `suppress` | outcome |
//! |---------------|-------------|------------|---------|
//! | yes | yes | - | sleep (long if `retry_needs_backoff`, else short), retry |
//! | yes | no | yes | `Ok(None)` under [`SuppressionPolicy::SuppressTransient`] |
//! | yes | no | no | error, annotated as exhausted |
//! | no | - | yes | `Ok(None)` under [`SuppressionPolicy::SuppressTransient`] |
//! | no | - | no | error as classified |
//!
//! # Budget
//!
//! [`RetryBudget`] clamps the caller's retry count to the configured ceiling
//! (at most 10) and the per-attempt timeout window into the band of its
//! [`OperationClass`]. A budget is built per call and never shared.

use std::{future::Future, time::Duration};

use fail::fail_point;

use crate::{
    config::{RetryConfig, SuppressionPolicy},
    context::CallContext,
    error::{ClassifiedError, GatewayResult},
    metrics::Metrics,
};

/// Timeout band for point reads, writes and deletes.
pub const POINT_WINDOW: (Duration, Duration) = (Duration::from_secs(5), Duration::from_secs(15));

/// Timeout band for updates, batches, scans, queries and transactions.
pub const EXTENDED_WINDOW: (Duration, Duration) =
    (Duration::from_secs(10), Duration::from_secs(30));

/// Operation class selecting the timeout band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Single-item get / put / delete.
    Point,
    /// Update, query, scan, batch and transaction calls.
    Extended,
}

impl OperationClass {
    /// `(floor, ceiling)` of the per-attempt timeout window.
    #[must_use]
    pub fn window_bounds(self) -> (Duration, Duration) {
        match self {
            Self::Point => POINT_WINDOW,
            Self::Extended => EXTENDED_WINDOW,
        }
    }
}

/// What a caller asks of one `*_with_retry` call.
///
/// ```
/// use std::time::Duration;
///
/// use docstore_gateway::RetryOptions;
///
/// let options = RetryOptions::new(3).with_timeout_window(Duration::from_secs(20));
/// assert_eq!(options.max_retries, 3);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOptions {
    /// Retries after the first attempt, before the configured ceiling.
    pub max_retries: u32,
    /// Per-attempt timeout, clamped into the operation's band. `None` takes
    /// the band's floor.
    pub timeout_window: Option<Duration>,
}

impl RetryOptions {
    /// `max_retries` retries with the default window.
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self { max_retries, timeout_window: None }
    }

    /// Returns these options with a per-attempt timeout of `window`.
    #[must_use]
    pub const fn with_timeout_window(mut self, window: Duration) -> Self {
        self.timeout_window = Some(window);
        self
    }
}

impl From<u32> for RetryOptions {
    fn from(max_retries: u32) -> Self {
        Self::new(max_retries)
    }
}

/// Per-call retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    class: OperationClass,
    max_retries: u32,
    timeout_window: Duration,
}

impl RetryBudget {
    /// Builds a budget, clamping `max_retries` to `ceiling` and
    /// `timeout_window` into the class band.
    #[must_use]
    pub fn new(
        class: OperationClass,
        max_retries: u32,
        timeout_window: Duration,
        ceiling: u32,
    ) -> Self {
        let (floor, cap) = class.window_bounds();
        Self {
            class,
            max_retries: max_retries.min(ceiling),
            timeout_window: timeout_window.clamp(floor, cap),
        }
    }

    /// Budget with the class's floor window.
    #[must_use]
    pub fn for_class(class: OperationClass, max_retries: u32, config: &RetryConfig) -> Self {
        Self::for_options(class, RetryOptions::new(max_retries), config)
    }

    /// Budget for a caller's [`RetryOptions`].
    #[must_use]
    pub fn for_options(class: OperationClass, options: RetryOptions, config: &RetryConfig) -> Self {
        let window = options.timeout_window.unwrap_or(class.window_bounds().0);
        Self::new(class, options.max_retries, window, config.max_attempts_ceiling())
    }

    /// The operation class.
    #[must_use]
    pub fn class(&self) -> OperationClass {
        self.class
    }

    /// Retries allowed after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout_window(&self) -> Duration {
        self.timeout_window
    }
}

/// Runs `attempt` until it succeeds or its classification ends the loop.
///
/// Each attempt receives a context derived from `ctx` with the budget's
/// timeout window. Returns `Ok(Some(value))` on success and `Ok(None)` when
/// the final error was suppressed.
///
/// # Errors
///
/// Returns the final classified error when it is not suppressed, or a
/// cancellation / timeout error if `ctx` ends during a backoff sleep.
#[tracing::instrument(skip(ctx, budget, config, metrics, attempt), fields(max_retries = budget.max_retries()))]
pub async fn retry<T, F, Fut>(
    ctx: &CallContext,
    budget: &RetryBudget,
    config: &RetryConfig,
    metrics: Option<&Metrics>,
    operation_name: &str,
    mut attempt: F,
) -> GatewayResult<Option<T>>
where
    F: FnMut(CallContext) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut remaining = budget.max_retries();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(m) = metrics {
            m.record_attempt();
        }

        let err = match attempt(ctx.with_timeout(budget.timeout_window())).await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::debug!(operation = operation_name, attempts, "succeeded after retry");
                }
                return Ok(Some(value));
            },
            Err(err) => err,
        };

        if err.allow_retry() && remaining > 0 {
            let delay = if err.retry_needs_backoff() {
                config.backoff_delay()
            } else {
                config.immediate_delay()
            };
            if let Some(m) = metrics {
                m.record_retry();
            }
            tracing::debug!(
                operation = operation_name,
                attempt = attempts,
                remaining,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable error, sleeping before next attempt",
            );
            fail_point!("retry-before-sleep", |_| {
                Err(ClassifiedError::timeout("injected failure before retry sleep"))
            });
            ctx.sleep(delay, operation_name).await.map_err(|e| e.with_prefix(operation_name))?;
            remaining -= 1;
            continue;
        }

        let err = if err.allow_retry() {
            if let Some(m) = metrics {
                m.record_retry_exhausted();
            }
            err.with_prefix(&format!("({operation_name} retries exhausted after {attempts} attempts)"))
        } else {
            err
        };

        if err.suppress() && config.suppression() == SuppressionPolicy::SuppressTransient {
            if let Some(m) = metrics {
                m.record_suppressed();
            }
            tracing::warn!(
                operation = operation_name,
                attempts,
                error = %err,
                "suppressing transient error",
            );
            return Ok(None);
        }

        return Err(err);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::error::ErrorKind;

    fn config() -> RetryConfig {
        RetryConfig::builder()
            .backoff_delay(Duration::from_millis(500))
            .immediate_delay(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    fn budget(retries: u32) -> RetryBudget {
        RetryBudget::new(OperationClass::Point, retries, Duration::from_secs(5), 10)
    }

    fn flagged(allow_retry: bool, backoff: bool, suppress: bool) -> ClassifiedError {
        ClassifiedError::new(ErrorKind::Transport, "flagged", allow_retry, backoff, suppress)
    }

    #[test]
    fn test_budget_clamps_retries_and_window() {
        let point = RetryBudget::new(OperationClass::Point, 50, Duration::from_secs(1), 10);
        assert_eq!(point.max_retries(), 10);
        assert_eq!(point.timeout_window(), Duration::from_secs(5));

        let extended = RetryBudget::new(OperationClass::Extended, 3, Duration::from_secs(99), 10);
        assert_eq!(extended.max_retries(), 3);
        assert_eq!(extended.timeout_window(), Duration::from_secs(30));
    }

    #[rstest]
    #[case(None, Duration::from_secs(10))]
    #[case(Some(Duration::from_secs(20)), Duration::from_secs(20))]
    #[case(Some(Duration::from_secs(40)), Duration::from_secs(30))]
    #[case(Some(Duration::from_secs(2)), Duration::from_secs(10))]
    fn test_caller_window_is_kept_within_band(
        #[case] requested: Option<Duration>,
        #[case] expected: Duration,
    ) {
        let options = RetryOptions { max_retries: 2, timeout_window: requested };
        let budget = RetryBudget::for_options(OperationClass::Extended, options, &config());

        assert_eq!(budget.timeout_window(), expected);
        assert_eq!(budget.max_retries(), 2);
    }

    #[test]
    fn test_options_from_count_use_floor_window() {
        let budget = RetryBudget::for_options(OperationClass::Point, 4_u32.into(), &config());
        assert_eq!(budget, RetryBudget::for_class(OperationClass::Point, 4, &config()));
        assert_eq!(budget.timeout_window(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry(&CallContext::new(), &budget(3), &config(), None, "op", |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Ok(42) }
        })
        .await;

        assert_eq!(result, Ok(Some(42)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retryable_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&CallContext::new(), &budget(3), &config(), None, "op", |_| {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move { if n < 2 { Err(flagged(true, true, false)) } else { Ok("done") } }
        })
        .await;

        assert_eq!(result, Ok(Some("done")));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    // (allow_retry, needs_backoff, suppress) -> (attempts, suppressed to Ok(None))
    #[rstest]
    #[case(false, false, false, 1, false)]
    #[case(false, false, true, 1, true)]
    #[case(true, true, false, 3, false)]
    #[case(true, true, true, 3, true)]
    #[case(true, false, true, 3, true)]
    #[case(true, false, false, 3, false)]
    #[tokio::test(start_paused = true)]
    async fn test_outcome_truth_table(
        #[case] allow_retry: bool,
        #[case] backoff: bool,
        #[case] suppress: bool,
        #[case] expected_attempts: u32,
        #[case] suppressed: bool,
    ) {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<Option<()>> =
            retry(&CallContext::new(), &budget(2), &config(), None, "op", |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async move { Err(flagged(allow_retry, backoff, suppress)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::Relaxed), expected_attempts);
        if suppressed {
            assert_eq!(result, Ok(None));
        } else {
            let err = result.unwrap_err();
            assert_eq!(err.allow_retry(), allow_retry);
            assert_eq!(err.message().contains("retries exhausted"), allow_retry);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_makes_one_attempt_and_still_suppresses() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<Option<()>> =
            retry(&CallContext::new(), &budget(0), &config(), None, "op", |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(flagged(true, true, true)) }
            })
            .await;

        assert_eq!(result, Ok(None));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_policy_reports_suppressible_errors() {
        let config = RetryConfig::builder().suppression(SuppressionPolicy::Surface).build().unwrap();
        let result: GatewayResult<Option<()>> =
            retry(&CallContext::new(), &budget(1), &config, None, "PutItem", |_| async {
                Err(flagged(true, true, true))
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.suppress());
        assert!(err.message().starts_with("(PutItem retries exhausted after 2 attempts)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delay_depends_on_flag() {
        let start = tokio::time::Instant::now();
        let _: GatewayResult<Option<()>> =
            retry(&CallContext::new(), &budget(2), &config(), None, "op", |_| async {
                Err(flagged(true, true, false))
            })
            .await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));

        let start = tokio::time::Instant::now();
        let _: GatewayResult<Option<()>> =
            retry(&CallContext::new(), &budget(2), &config(), None, "op", |_| async {
                Err(flagged(true, false, false))
            })
            .await;
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_context_carries_timeout_window() {
        let ctx = CallContext::new();
        let result = retry(&ctx, &budget(0), &config(), None, "op", |attempt_ctx| async move {
            Ok(attempt_ctx.deadline())
        })
        .await
        .unwrap()
        .unwrap();

        let deadline = result.unwrap();
        assert_eq!(deadline - tokio::time::Instant::now(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_loop() {
        let ctx = CallContext::new();
        let calls = AtomicU32::new(0);
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let result: GatewayResult<Option<()>> =
            retry(&ctx, &budget(10), &config(), None, "op", |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(flagged(true, true, true)) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), &ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_metrics() {
        let metrics = Metrics::new();
        let calls = AtomicU32::new(0);
        let _ = retry(&CallContext::new(), &budget(3), &config(), Some(&metrics), "op", |_| {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move { if n < 2 { Err(flagged(true, false, true)) } else { Ok(()) } }
        })
        .await;

        let exhausted: GatewayResult<Option<()>> =
            retry(&CallContext::new(), &budget(1), &config(), Some(&metrics), "op", |_| async {
                Err(flagged(true, false, true))
            })
            .await;
        assert_eq!(exhausted, Ok(None));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempt_count, 5);
        assert_eq!(snapshot.retry_count, 3);
        assert_eq!(snapshot.retry_exhausted_count, 1);
        assert_eq!(snapshot.suppressed_count, 1);
    }
}
